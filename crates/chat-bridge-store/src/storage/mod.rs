//! Storage implementations.

use std::sync::Arc;

use chat_bridge_core::{CredentialStore, StoreError};
use serde::Deserialize;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "mongo")]
pub mod mongo;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;
#[cfg(feature = "mongo")]
pub use mongo::MongoStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

pub const DEFAULT_MONGO_DATABASE: &str = "whatsapp_api";
pub const DEFAULT_POSTGRES_SCHEMA: &str = "public";
pub const DEFAULT_TABLE: &str = "baileys_auth_state";

/// Which backend holds the credentials, and where.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    Mongo {
        url: String,
        #[serde(default = "default_database")]
        database: String,
        #[serde(default = "default_table")]
        collection: String,
    },
    Postgres {
        url: String,
        #[serde(default = "default_schema")]
        schema: String,
        #[serde(default = "default_table")]
        table: String,
    },
}

fn default_database() -> String {
    DEFAULT_MONGO_DATABASE.to_string()
}

fn default_schema() -> String {
    DEFAULT_POSTGRES_SCHEMA.to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

impl StoreConfig {
    /// Backend name for logging.
    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Mongo { .. } => "mongo",
            Self::Postgres { .. } => "postgres",
        }
    }

    /// Check the configuration without connecting anywhere.
    ///
    /// # Errors
    /// Returns [`StoreError::Config`] for an empty URL or a name that is not
    /// a plain SQL identifier.
    pub fn validate(&self) -> Result<(), StoreError> {
        match self {
            Self::Memory => Ok(()),
            Self::Mongo {
                url,
                database,
                collection,
            } => {
                require("mongo url", url)?;
                require("mongo database", database)?;
                require("mongo collection", collection)
            }
            Self::Postgres { url, schema, table } => {
                require("postgres url", url)?;
                validate_identifier("schema", schema)?;
                validate_identifier("table", table)
            }
        }
    }
}

fn require(what: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::Config(format!("{what} must not be empty")));
    }
    Ok(())
}

/// Postgres identifiers are interpolated into SQL, so only plain names pass.
pub(crate) fn validate_identifier(kind: &str, name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63;

    if valid {
        Ok(())
    } else {
        Err(StoreError::Config(format!("invalid {kind} name: {name:?}")))
    }
}

/// Open the configured backend.
///
/// # Errors
/// Returns an error if the configuration is invalid, the backend was not
/// compiled in, or the database cannot be reached.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn CredentialStore>, StoreError> {
    config.validate()?;
    tracing::info!(backend = config.backend(), "opening credential store");

    match config {
        #[cfg(feature = "memory")]
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "mongo")]
        StoreConfig::Mongo {
            url,
            database,
            collection,
        } => Ok(Arc::new(MongoStore::connect(url, database, collection).await?)),
        #[cfg(feature = "postgres")]
        StoreConfig::Postgres { url, schema, table } => {
            Ok(Arc::new(PostgresStore::connect(url, schema, table).await?))
        }
        #[allow(unreachable_patterns)]
        other => Err(StoreError::Config(format!(
            "{} backend is not enabled in this build",
            other.backend()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{ "backend": "mongo", "url": "mongodb://localhost:27017" }"#)
                .unwrap();
        assert_eq!(
            config,
            StoreConfig::Mongo {
                url: "mongodb://localhost:27017".to_string(),
                database: "whatsapp_api".to_string(),
                collection: "baileys_auth_state".to_string(),
            }
        );

        let config: StoreConfig =
            serde_json::from_str(r#"{ "backend": "postgres", "url": "postgres://x" }"#).unwrap();
        let StoreConfig::Postgres { schema, table, .. } = config else {
            panic!("expected postgres config");
        };
        assert_eq!(schema, "public");
        assert_eq!(table, "baileys_auth_state");
    }

    #[test]
    fn test_validate() {
        assert!(StoreConfig::Memory.validate().is_ok());

        let empty_url = StoreConfig::Postgres {
            url: " ".to_string(),
            schema: "public".to_string(),
            table: "auth".to_string(),
        };
        assert!(matches!(empty_url.validate(), Err(StoreError::Config(_))));

        let injected = StoreConfig::Postgres {
            url: "postgres://x".to_string(),
            schema: "public".to_string(),
            table: "auth; DROP TABLE users".to_string(),
        };
        assert!(matches!(injected.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("table", "baileys_auth_state").is_ok());
        assert!(validate_identifier("table", "_t1").is_ok());
        assert!(validate_identifier("table", "").is_err());
        assert!(validate_identifier("table", "1abc").is_err());
        assert!(validate_identifier("table", "a-b").is_err());
        assert!(validate_identifier("table", "a\"b").is_err());
        assert!(validate_identifier("table", &"x".repeat(64)).is_err());
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open_store(&StoreConfig::Memory).await.unwrap();
        assert!(store.read("creds").await.unwrap().is_none());
    }
}
