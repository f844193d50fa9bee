//! PostgreSQL credential storage (feature-gated).
//!
//! One row per key in `<schema>.<table> (id VARCHAR(255) PRIMARY KEY, value JSONB)`.

use async_trait::async_trait;
use chat_bridge_core::{
    CredentialStore, StoreError, StoredValue,
    store::{present, write_encoded},
    value::{CodecError, MAX_DEPTH},
};
use sqlx::{
    PgPool,
    postgres::PgPoolOptions,
    types::Json,
};
use tracing::info;

use super::validate_identifier;

const MAX_CONNECTIONS: u32 = 5;

/// Credential store backed by a PostgreSQL table.
pub struct PostgresStore {
    pool: PgPool,
    /// Qualified `schema.table`, validated at construction.
    table: String,
}

impl PostgresStore {
    /// Connect and create the schema and table if missing.
    ///
    /// # Errors
    /// Returns an error if a name is not a plain identifier, the database
    /// is unreachable, or the table cannot be created.
    pub async fn connect(url: &str, schema: &str, table: &str) -> Result<Self, StoreError> {
        validate_identifier("schema", schema)?;
        validate_identifier("table", table)?;

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(url)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to connect to PostgreSQL: {e}")))?;

        let store = Self {
            pool,
            table: format!("{schema}.{table}"),
        };
        store.ensure_schema(schema).await?;
        info!(table = %store.table, "connected to PostgreSQL credential store");
        Ok(store)
    }

    async fn ensure_schema(&self, schema: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id VARCHAR(255) PRIMARY KEY, value JSONB NOT NULL)",
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn put(&self, key: &str, json: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, value) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET value = EXCLUDED.value",
            self.table
        ))
        .bind(key)
        .bind(Json(json))
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(key, &e))?;
        Ok(())
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Depth rejections are reported as cyclic values so the caller's
/// sanitize-and-retry path applies.
fn write_error(key: &str, err: &sqlx::Error) -> StoreError {
    let message = err.to_string();
    if message.contains("depth") {
        StoreError::codec(key, CodecError::Cyclic { limit: MAX_DEPTH })
    } else {
        StoreError::Backend(message)
    }
}

#[async_trait]
impl CredentialStore for PostgresStore {
    async fn read(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let row: Option<Json<serde_json::Value>> =
            sqlx::query_scalar(&format!("SELECT value FROM {} WHERE id = $1", self.table))
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        Ok(row.map(|Json(value)| StoredValue::from_json(value)))
    }

    async fn write(&self, key: &str, value: Option<&StoredValue>) -> Result<(), StoreError> {
        match present(value) {
            Some(value) => write_encoded(key, value, |json| self.put(key, json)).await,
            None => self.remove(key).await,
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        info!(
            deleted = result.rows_affected(),
            table = %self.table,
            "cleared PostgreSQL credential store"
        );
        Ok(())
    }
}
