use async_trait::async_trait;
use log::{info, warn};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use super::{KeyValueStorage, StorageError, StorageResult};
use crate::utils::ensure_directory_exists;

/// All keys in one JSON object file. Writes go to a temporary file that is
/// renamed over the original, so a crash never leaves a half-written blob.
pub struct JsonFileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> StorageResult<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|source| StorageError::Read {
                path: self.path.clone(),
                source,
            })?;
        if content.trim().is_empty() {
            warn!("Storage file {:?} is empty, starting fresh.", self.path);
            return Ok(Map::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_all(&self, values: &Map<String, Value>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            ensure_directory_exists(parent)
                .await
                .map_err(|e| StorageError::Directory {
                    path: parent.to_path_buf(),
                    message: e.to_string(),
                })?;
        }
        let content = serde_json::to_string_pretty(values)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .await
            .map_err(|source| StorageError::Write {
                path: tmp_path.clone(),
                source,
            })?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStorage for JsonFileStorage {
    async fn get_value(&self, key: &str) -> StorageResult<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.get(key).cloned())
    }

    async fn put_value(&self, key: &str, value: Value) -> StorageResult<()> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value);
        self.write_all(&values).await?;
        info!("Stored {:?} in {:?}", key, self.path);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        if values.remove(key).is_some() {
            self.write_all(&values).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let storage = JsonFileStorage::new(&path);
        storage.put_value("a", Value::from(vec![1, 2, 3])).await.unwrap();
        storage.put_value("b", Value::from("text")).await.unwrap();
        drop(storage);

        let reopened = JsonFileStorage::new(&path);
        assert_eq!(reopened.get_value("a").await.unwrap(), Some(Value::from(vec![1, 2, 3])));
        assert_eq!(reopened.get_value("b").await.unwrap(), Some(Value::from("text")));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn remove_deletes_only_that_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("storage.json"));
        storage.put_value("a", Value::from(1)).await.unwrap();
        storage.put_value("b", Value::from(2)).await.unwrap();

        storage.remove("a").await.unwrap();

        assert_eq!(storage.get_value("a").await.unwrap(), None);
        assert_eq!(storage.get_value("b").await.unwrap(), Some(Value::from(2)));
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "{not json").unwrap();

        let storage = JsonFileStorage::new(&path);
        assert!(matches!(
            storage.get_value("a").await,
            Err(StorageError::Serialization(_))
        ));
    }
}
