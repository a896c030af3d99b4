//! Key-value persistence
//!
//! The subsystem only needs an opaque key-value store holding JSON values.
//! Typed access goes through [`put_serializable`] and [`get_serializable_list`].

mod file;
mod memory;

pub use file::JsonFileStorage;
pub use memory::InMemoryStorage;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create directory {}: {message}", path.display())]
    Directory { path: PathBuf, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage is unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// An opaque key-value store of JSON values
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get_value(&self, key: &str) -> StorageResult<Option<Value>>;

    async fn put_value(&self, key: &str, value: Value) -> StorageResult<()>;

    async fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Stores `value` under `key`, replacing whatever was there
pub async fn put_serializable<T>(storage: &dyn KeyValueStorage, key: &str, value: &T) -> StorageResult<()>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(value)?;
    storage.put_value(key, value).await
}

/// Reads the list stored under `key`; a missing key is an empty list
pub async fn get_serializable_list<T>(storage: &dyn KeyValueStorage, key: &str) -> StorageResult<Vec<T>>
where
    T: DeserializeOwned,
{
    match storage.get_value(key).await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(Vec::new()),
    }
}
