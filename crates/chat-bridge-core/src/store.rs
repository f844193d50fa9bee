//! Credential store contract shared by every backend.

use std::{collections::BTreeMap, future::Future};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;

use crate::{
    Credentials,
    credentials::CREDS_KEY,
    value::{CodecError, StoredValue},
};

/// Batched signal-key changes: category -> id -> value (`None` deletes).
pub type KeyUpdates = BTreeMap<String, BTreeMap<String, Option<StoredValue>>>;

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Serialization error for {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: CodecError,
    },
    #[error("Storage error: {0}")]
    Backend(String),
    #[error("Invalid store configuration: {0}")]
    Config(String),
    #[error("{} key operation(s) failed", .failed.len())]
    Partial { failed: Vec<(String, StoreError)> },
}

impl StoreError {
    /// Whether this is a serialization fault caused by a cyclic value.
    #[must_use]
    pub fn is_cyclic(&self) -> bool {
        matches!(self, Self::Serialization { source, .. } if source.is_cyclic())
    }

    #[must_use]
    pub fn codec(key: &str, source: CodecError) -> Self {
        Self::Serialization {
            key: key.to_string(),
            source,
        }
    }
}

/// Storage key for a piece of signal key material.
#[must_use]
pub fn signal_key(category: &str, id: &str) -> String {
    format!("{category}-{id}")
}

/// `None` for values that mean "delete".
#[must_use]
pub fn present(value: Option<&StoredValue>) -> Option<&StoredValue> {
    value.filter(|v| !v.is_null())
}

/// Encode `value` and hand it to `put`, recovering once from a cyclic value.
///
/// If encoding or the backend reports a cyclic-reference fault, the value
/// is sanitized with [`StoredValue::sanitized`] and written one more time.
/// A second failure is returned to the caller.
///
/// # Errors
/// Returns the backend's error, or the serialization error of the retry.
pub async fn write_encoded<F, Fut>(key: &str, value: &StoredValue, mut put: F) -> Result<(), StoreError>
where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let first = match value.to_json() {
        Ok(json) => put(json).await,
        Err(source) => Err(StoreError::codec(key, source)),
    };

    match first {
        Err(err) if err.is_cyclic() => {
            tracing::warn!(key, error = %err, "cyclic value, retrying with sanitized copy");
            let json = value
                .sanitized()
                .to_json()
                .map_err(|source| StoreError::codec(key, source))?;
            put(json).await?;
            tracing::info!(key, "saved sanitized value");
            Ok(())
        }
        Err(err) => {
            tracing::error!(key, error = %err, "failed to write value");
            Err(err)
        }
        ok => ok,
    }
}

/// Trait for credential storage backends.
///
/// Backends implement the four primitive operations; the credential and
/// bulk signal-key helpers are shared.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read a value. `None` if the key was never written.
    async fn read(&self, key: &str) -> Result<Option<StoredValue>, StoreError>;

    /// Replace the value under `key`. `None` or `Null` deletes it.
    async fn write(&self, key: &str, value: Option<&StoredValue>) -> Result<(), StoreError>;

    /// Delete a key. Succeeds if the key does not exist.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Delete every key in this store's namespace.
    async fn clear_all(&self) -> Result<(), StoreError>;

    /// Read the saved credentials, or synthesize and persist fresh ones.
    ///
    /// An unreadable record is replaced with fresh material; a failing read
    /// is returned as an error so valid credentials are never overwritten.
    async fn load_or_init_credentials(&self) -> Result<Credentials, StoreError> {
        match self.read(CREDS_KEY).await? {
            Some(value) => match value.deserialize_into::<Credentials>() {
                Ok(creds) => {
                    tracing::debug!(registered = creds.registered, "loaded stored credentials");
                    return Ok(creds);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stored credentials are unreadable, generating fresh ones");
                }
            },
            None => tracing::info!("no stored credentials, generating fresh ones"),
        }

        let creds = Credentials::generate();
        self.save_credentials(&creds).await?;
        Ok(creds)
    }

    /// Persist the credential record.
    async fn save_credentials(&self, creds: &Credentials) -> Result<(), StoreError> {
        let value =
            StoredValue::from_serializable(creds).map_err(|e| StoreError::codec(CREDS_KEY, e))?;
        self.write(CREDS_KEY, Some(&value)).await
    }

    /// Read many signal keys of one category concurrently.
    ///
    /// Every requested id gets an entry. A failed read is logged and
    /// reported as absent.
    async fn bulk_get_keys(
        &self,
        category: &str,
        ids: &[String],
    ) -> Result<BTreeMap<String, Option<StoredValue>>, StoreError> {
        let reads = ids.iter().map(|id| async move {
            let key = signal_key(category, id);
            let value = self.read(&key).await.unwrap_or_else(|e| {
                tracing::warn!(key = %key, error = %e, "failed to read signal key");
                None
            });
            (id.clone(), value)
        });

        Ok(join_all(reads).await.into_iter().collect())
    }

    /// Write or delete many signal keys concurrently.
    ///
    /// Each write is independent; all are awaited before failures are
    /// reported together as [`StoreError::Partial`].
    async fn bulk_set_keys(&self, updates: KeyUpdates) -> Result<(), StoreError> {
        let ops = updates.iter().flat_map(|(category, ids)| {
            ids.iter().map(move |(id, value)| async move {
                let key = signal_key(category, id);
                let result = match present(value.as_ref()) {
                    Some(v) => self.write(&key, Some(v)).await,
                    None => self.remove(&key).await,
                };
                result.map_err(|e| (key, e))
            })
        });

        let failed: Vec<_> = join_all(ops)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Partial { failed })
        }
    }
}
