use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::{APPLICATION, ORGANIZATION, QUALIFIER};

const STORAGE_FILE_NAME: &str = "ble_storage.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Overrides the platform data directory
    pub data_dir: Option<PathBuf>,
    pub file_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: None,
            file_name: STORAGE_FILE_NAME.to_string(),
        }
    }
}

impl StorageConfig {
    /// Full path of the storage file, or None when no data directory
    /// is configured and the platform has none
    pub fn resolve_path(&self) -> Option<PathBuf> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)?
                .data_dir()
                .to_path_buf(),
        };
        Some(dir.join(&self.file_name))
    }
}
