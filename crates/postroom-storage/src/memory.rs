//! In-memory store

use crate::kv::{KvStore, Record};
use async_trait::async_trait;
use postroom_common::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Store that keeps everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<(String, String), Record>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys across all scopes
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn read(&self, scope: &str, key: &str) -> Record {
        self.records
            .read()
            .await
            .get(&(scope.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    async fn write(&self, scope: &str, key: &str, value: Record) {
        let mut records = self.records.write().await;
        let id = (scope.to_string(), key.to_string());
        if value.is_empty() {
            records.remove(&id);
        } else {
            records.insert(id, value);
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Record> {
        Ok(self.read("", key).await)
    }

    async fn set(&self, key: &str, value: Record) -> Result<()> {
        self.write("", key, value).await;
        Ok(())
    }

    async fn get_scoped(&self, room: &str, key: &str) -> Result<Record> {
        Ok(self.read(room, key).await)
    }

    async fn set_scoped(&self, room: &str, key: &str, value: Record) -> Result<()> {
        self.write(room, key, value).await;
        Ok(())
    }
}
