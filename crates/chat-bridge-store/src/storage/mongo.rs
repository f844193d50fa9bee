//! MongoDB credential storage.
//!
//! One document per key: `{ _id: <key>, value: <encoded value> }`.

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use chat_bridge_core::{
    CredentialStore, StoreError, StoredValue,
    store::{present, write_encoded},
    value::{CodecError, MAX_DEPTH},
};
use mongodb::{Client, Collection};
use tracing::{info, warn};

/// Credential store backed by a MongoDB collection.
#[derive(Clone)]
pub struct MongoStore {
    collection: Collection<Document>,
}

impl MongoStore {
    /// Connect and verify the server answers a ping.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, database: &str, collection: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(with_timeouts(url))
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to connect to MongoDB: {e}")))?;

        client
            .database(database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StoreError::Backend(format!("MongoDB ping failed: {e}")))?;

        info!(database, collection, "connected to MongoDB credential store");
        Ok(Self::from_collection(
            client.database(database).collection(collection),
        ))
    }

    /// Use an existing collection handle.
    #[must_use]
    pub const fn from_collection(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    async fn put(&self, key: &str, json: serde_json::Value) -> Result<(), StoreError> {
        let value = bson::to_bson(&json).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.collection
            .replace_one(doc! { "_id": key }, doc! { "_id": key, "value": value })
            .upsert(true)
            .await
            .map_err(|e| backend_error(key, &e))?;
        Ok(())
    }
}

/// Keep an unreachable server from hanging startup.
fn with_timeouts(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}serverSelectionTimeoutMS=3000&connectTimeoutMS=3000")
}

/// Nesting rejections from the server are reported as cyclic values so the
/// caller's sanitize-and-retry path applies.
fn backend_error(key: &str, err: &mongodb::error::Error) -> StoreError {
    let message = err.to_string();
    if message.contains("nested") || message.contains("nesting") {
        StoreError::codec(key, CodecError::Cyclic { limit: MAX_DEPTH })
    } else {
        StoreError::Backend(message)
    }
}

#[async_trait]
impl CredentialStore for MongoStore {
    async fn read(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let Some(document) = self
            .collection
            .find_one(doc! { "_id": key })
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
        else {
            return Ok(None);
        };

        match document.get("value") {
            Some(Bson::Null) | None => {
                warn!(key, "stored document has no value");
                Ok(None)
            }
            Some(value) => Ok(Some(StoredValue::from_json(
                value.clone().into_relaxed_extjson(),
            ))),
        }
    }

    async fn write(&self, key: &str, value: Option<&StoredValue>) -> Result<(), StoreError> {
        match present(value) {
            Some(value) => write_encoded(key, value, |json| self.put(key, json)).await,
            None => self.remove(key).await,
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.collection
            .delete_one(doc! { "_id": key })
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let result = self
            .collection
            .delete_many(doc! {})
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        info!(
            deleted = result.deleted_count,
            collection = self.collection.name(),
            "cleared MongoDB credential store"
        );
        Ok(())
    }
}
