//! Keyed store abstraction

use crate::db::{DatabasePool, DbStore};
use crate::memory::MemoryStore;
use async_trait::async_trait;
use postroom_common::config::DatabaseConfig;
use postroom_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A stored value: a flat string map
pub type Record = HashMap<String, String>;

/// Keyed durable store.
///
/// Reading a missing key yields an empty record; writing an empty record
/// removes the key.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a process-wide record
    async fn get(&self, key: &str) -> Result<Record>;

    /// Write a process-wide record
    async fn set(&self, key: &str, value: Record) -> Result<()>;

    /// Read a record scoped to a room
    async fn get_scoped(&self, room: &str, key: &str) -> Result<Record>;

    /// Write a record scoped to a room
    async fn set_scoped(&self, room: &str, key: &str, value: Record) -> Result<()>;
}

/// Create the store selected by configuration
pub async fn create_store(config: &DatabaseConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend.as_str() {
        "postgres" => {
            let pool = DatabasePool::new(config).await?;
            pool.migrate().await?;
            Ok(Arc::new(DbStore::new(pool)))
        }
        "memory" => Ok(Arc::new(MemoryStore::new())),
        other => Err(Error::Config(format!(
            "Unsupported database backend: {}",
            other
        ))),
    }
}
