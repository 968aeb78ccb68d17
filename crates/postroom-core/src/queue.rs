//! Delivery queue
//!
//! Durable retry store for outbound emails that failed with a transient
//! error. Items live under `queue.item.<id>`, the set of pending ids in the
//! `queue.index` record. Processing is a single unit of work triggered from
//! outside; it holds the index lock for the whole sweep.

use crate::delivery::Transport;
use crate::locks::KeyedLocks;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use postroom_common::{Error, Result};
use postroom_storage::{KvStore, Record};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Store key of the queue index
pub const QUEUE_INDEX_KEY: &str = "queue.index";

const ITEM_PREFIX: &str = "queue.item.";

fn item_key(id: &str) -> String {
    format!("{}{}", ITEM_PREFIX, id)
}

/// Queued outbound email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub data: Vec<u8>,
    pub relay_override: Option<String>,
    pub attempts: u32,
}

impl QueueItem {
    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("id".to_string(), self.id.clone());
        record.insert("from".to_string(), self.from.clone());
        record.insert("to".to_string(), self.to.join(","));
        record.insert("data".to_string(), BASE64.encode(&self.data));
        if let Some(relay) = &self.relay_override {
            record.insert("relay".to_string(), relay.clone());
        }
        record.insert("attempts".to_string(), self.attempts.to_string());
        record
    }

    fn from_record(record: &Record) -> Result<Self> {
        let field = |name: &str| record.get(name).cloned().unwrap_or_default();
        let data = BASE64
            .decode(field("data"))
            .map_err(|e| Error::Storage(format!("Corrupt queue item payload: {}", e)))?;
        Ok(Self {
            id: field("id"),
            from: field("from"),
            to: field("to")
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            data,
            relay_override: record.get("relay").filter(|r| !r.is_empty()).cloned(),
            attempts: field("attempts").parse().unwrap_or(0),
        })
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub sent: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Durable delivery queue
pub struct DeliveryQueue {
    store: Arc<dyn KvStore>,
    locks: Arc<KeyedLocks>,
    transport: Arc<dyn Transport>,
}

impl DeliveryQueue {
    pub fn new(store: Arc<dyn KvStore>, locks: Arc<KeyedLocks>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            locks,
            transport,
        }
    }

    /// Persist an item, then list it in the index
    pub async fn add(
        &self,
        id: &str,
        from: &str,
        to: &[String],
        data: &[u8],
        relay_override: Option<&str>,
    ) -> Result<()> {
        let key = item_key(id);
        let item = QueueItem {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_vec(),
            data: data.to_vec(),
            relay_override: relay_override.map(str::to_string),
            attempts: 0,
        };

        {
            let _item_lock = self.locks.lock(&key).await;
            self.store.set(&key, item.to_record()).await?;
        }

        {
            let _index_lock = self.locks.lock(QUEUE_INDEX_KEY).await;
            let mut index = self.store.get(QUEUE_INDEX_KEY).await?;
            index.insert(id.to_string(), key);
            self.store.set(QUEUE_INDEX_KEY, index).await?;
        }

        info!(queue_item = %id, from = %from, to = ?to, "Email queued for retry");
        Ok(())
    }

    /// Retry up to `batch_size + 1` queued items.
    ///
    /// An item whose next attempt would exceed `max_retries` is dropped
    /// without another send.
    pub async fn process(&self, batch_size: usize, max_retries: u32) -> Result<QueueReport> {
        let _index_lock = self.locks.lock(QUEUE_INDEX_KEY).await;
        let mut index = self.store.get(QUEUE_INDEX_KEY).await?;
        if index.is_empty() {
            return Ok(QueueReport::default());
        }

        let mut ids: Vec<String> = index.keys().cloned().collect();
        ids.sort();
        ids.truncate(batch_size.saturating_add(1));

        let mut report = QueueReport::default();
        for id in ids {
            let Some(key) = index.get(&id).cloned() else {
                continue;
            };
            let _item_lock = self.locks.lock(&key).await;

            let record = self.store.get(&key).await?;
            let mut item = match QueueItem::from_record(&record) {
                Ok(item) if !record.is_empty() => item,
                Ok(_) => {
                    warn!(queue_item = %id, "Queue item vanished, unlisting");
                    index.remove(&id);
                    continue;
                }
                Err(e) => {
                    warn!(queue_item = %id, "Dropping unreadable queue item: {}", e);
                    self.store.set(&key, Record::new()).await?;
                    index.remove(&id);
                    report.dropped += 1;
                    continue;
                }
            };

            let attempt = item.attempts + 1;
            if attempt > max_retries {
                // Expired items are dropped without notifying anyone
                warn!(
                    queue_item = %id,
                    from = %item.from,
                    to = ?item.to,
                    attempts = item.attempts,
                    "Retry budget exhausted, dropping queued email"
                );
                self.store.set(&key, Record::new()).await?;
                index.remove(&id);
                report.dropped += 1;
                continue;
            }

            match self
                .transport
                .send(&item.from, &item.to, &item.data, item.relay_override.as_deref())
                .await
            {
                Ok(()) => {
                    info!(queue_item = %id, attempt, "Queued email delivered");
                    self.store.set(&key, Record::new()).await?;
                    index.remove(&id);
                    report.sent += 1;
                }
                Err(e) => {
                    debug!(queue_item = %id, attempt, "Queued email still failing: {}", e);
                    item.attempts = attempt;
                    self.store.set(&key, item.to_record()).await?;
                    report.failed += 1;
                }
            }
        }

        self.store.set(QUEUE_INDEX_KEY, index).await?;
        if report != QueueReport::default() {
            info!(
                sent = report.sent,
                failed = report.failed,
                dropped = report.dropped,
                "Queue sweep finished"
            );
        }
        Ok(report)
    }

    /// Unlist an item and clear its payload
    pub async fn remove(&self, id: &str) -> Result<()> {
        let key = item_key(id);
        {
            let _index_lock = self.locks.lock(QUEUE_INDEX_KEY).await;
            let mut index = self.store.get(QUEUE_INDEX_KEY).await?;
            if index.remove(id).is_some() {
                self.store.set(QUEUE_INDEX_KEY, index).await?;
            }
        }
        let _item_lock = self.locks.lock(&key).await;
        self.store.set(&key, Record::new()).await
    }

    /// Ids of queued items
    pub async fn pending(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.store.get(QUEUE_INDEX_KEY).await?.into_keys().collect();
        ids.sort();
        Ok(ids)
    }
}
