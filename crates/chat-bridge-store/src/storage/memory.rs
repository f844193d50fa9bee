//! In-memory credential storage.

use std::{collections::HashMap, future, sync::RwLock};

use async_trait::async_trait;
use chat_bridge_core::{
    CredentialStore, StoreError, StoredValue,
    store::{present, write_encoded},
};
use serde_json::Value;

/// In-memory storage implementation.
///
/// Useful for development and tests. Values go through the same JSON
/// encoding as the database backends. Data is lost on restart.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored keys.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self
            .entries
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .len())
    }

    /// Whether the store holds no keys.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn put(&self, key: &str, json: Value) -> Result<(), StoreError> {
        self.entries
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .insert(key.to_string(), json);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        Ok(self
            .entries
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .get(key)
            .cloned()
            .map(StoredValue::from_json))
    }

    async fn write(&self, key: &str, value: Option<&StoredValue>) -> Result<(), StoreError> {
        match present(value) {
            Some(value) => {
                write_encoded(key, value, |json| future::ready(self.put(key, json))).await
            }
            None => self.remove(key).await,
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .remove(key);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let cleared = entries.len();
        entries.clear();
        tracing::info!(cleared, "cleared in-memory credential store");
        Ok(())
    }
}
