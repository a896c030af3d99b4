pub mod bluetooth_config;
pub mod logging_config;
pub mod storage_config;

use directories::ProjectDirs;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::config::logging_config::LoggingConfig;
use crate::config::storage_config::StorageConfig;
use crate::utils::ensure_directory_exists;

pub(crate) const QUALIFIER: &str = "io";
pub(crate) const ORGANIZATION: &str = "ble-health-bridge";
pub(crate) const APPLICATION: &str = "ble-health-bridge";

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    Directory(String),

    #[error("No configuration directory available on this platform")]
    NoConfigDirectory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bluetooth: BluetoothConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// The platform config location, e.g. `~/.config/ble-health-bridge/config.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .ok_or(ConfigError::NoConfigDirectory)
    }

    /// Loads the config from a file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the config, creating the parent directory if needed
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            ensure_directory_exists(dir)
                .await
                .map_err(|e| ConfigError::Directory(e.to_string()))?;
        }

        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        info!("Config saved to {:?}.", path);
        Ok(())
    }
}
