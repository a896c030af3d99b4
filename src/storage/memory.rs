use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::{KeyValueStorage, StorageError, StorageResult};

/// Process-local storage; contents are lost on exit
#[derive(Default)]
pub struct InMemoryStorage {
    values: Mutex<HashMap<String, Value>>,
    fail_writes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, simulating an unavailable disk
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStorage for InMemoryStorage {
    async fn get_value(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put_value(&self, key: &str, value: Value) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        self.values.lock().await.remove(key);
        Ok(())
    }
}
