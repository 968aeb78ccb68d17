//! PostgreSQL-backed store

use crate::kv::{KvStore, Record};
use async_trait::async_trait;
use postroom_common::config::DatabaseConfig;
use postroom_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

/// Database pool wrapper
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::Config("Database URL required for PostgreSQL".to_string()))?;

        info!(backend = %config.backend, "Connecting to database");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect: {}", e)))?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Migration failed: {}", e)))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// Keyed store over the `kv_store` table
pub struct DbStore {
    pool: DatabasePool,
}

impl DbStore {
    /// Create a new store over an existing pool
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn read(&self, scope: &str, key: &str) -> Result<Record> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT value FROM kv_store WHERE scope = $1 AND key = $2")
                .bind(scope)
                .bind(key)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Storage(format!("Failed to read {}: {}", key, e)))?;

        match row {
            Some((value,)) => serde_json::from_value(value)
                .map_err(|e| Error::Storage(format!("Corrupt record {}: {}", key, e))),
            None => Ok(Record::new()),
        }
    }

    async fn write(&self, scope: &str, key: &str, value: Record) -> Result<()> {
        if value.is_empty() {
            sqlx::query("DELETE FROM kv_store WHERE scope = $1 AND key = $2")
                .bind(scope)
                .bind(key)
                .execute(self.pool.pool())
                .await
                .map_err(|e| Error::Storage(format!("Failed to delete {}: {}", key, e)))?;
            debug!(scope = %scope, key = %key, "Deleted record");
            return Ok(());
        }

        let value = serde_json::to_value(&value)
            .map_err(|e| Error::Storage(format!("Failed to encode {}: {}", key, e)))?;

        sqlx::query(
            r#"
            INSERT INTO kv_store (scope, key, value, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (scope, key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(value)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(format!("Failed to write {}: {}", key, e)))?;

        debug!(scope = %scope, key = %key, "Stored record");
        Ok(())
    }
}

#[async_trait]
impl KvStore for DbStore {
    async fn get(&self, key: &str) -> Result<Record> {
        self.read("", key).await
    }

    async fn set(&self, key: &str, value: Record) -> Result<()> {
        self.write("", key, value).await
    }

    async fn get_scoped(&self, room: &str, key: &str) -> Result<Record> {
        self.read(room, key).await
    }

    async fn set_scoped(&self, room: &str, key: &str, value: Record) -> Result<()> {
        self.write(room, key, value).await
    }
}
