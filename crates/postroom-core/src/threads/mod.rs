//! Thread reconciler
//!
//! Correlates email threads (Message-Id, In-Reply-To, References) with room
//! threads. Per room it keeps two maps in the store:
//!
//! * `thread.msg.<message-id>`: thread root event and the email's references
//! * `thread.last.<root-event>`: most recent event of that thread
//!
//! Entries are append-only: once a Message-Id is bound to a root it keeps
//! resolving to that root.

mod reversal;

pub use reversal::{message_id_for, Correspondents, PreviousTurn};

use crate::email::Email;
use postroom_common::types::EventId;
use postroom_common::Result;
use postroom_storage::{KvStore, Record};
use std::sync::Arc;
use tracing::{debug, warn};

const MESSAGE_PREFIX: &str = "thread.msg.";
const LAST_PREFIX: &str = "thread.last.";
const FIELD_ROOT: &str = "root";
const FIELD_REFERENCES: &str = "references";
const FIELD_EVENT: &str = "event";

fn message_key(message_id: &str) -> String {
    format!("{}{}", MESSAGE_PREFIX, message_id.to_lowercase())
}

fn last_key(root: &str) -> String {
    format!("{}{}", LAST_PREFIX, root)
}

/// Stored association of one email turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAssociation {
    pub message_id: String,
    pub thread_root: EventId,
    pub references: Vec<String>,
}

/// Thread reconciler over the keyed store
pub struct Reconciler {
    store: Arc<dyn KvStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Stored association for a Message-Id
    pub async fn lookup(&self, room: &str, message_id: &str) -> Result<Option<ThreadAssociation>> {
        let record = self.store.get_scoped(room, &message_key(message_id)).await?;
        Ok(record.get(FIELD_ROOT).filter(|r| !r.is_empty()).map(|root| {
            ThreadAssociation {
                message_id: message_id.to_string(),
                thread_root: root.clone(),
                references: record
                    .get(FIELD_REFERENCES)
                    .map(|r| r.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            }
        }))
    }

    /// Whether this Message-Id was already delivered to the room
    pub async fn is_known(&self, room: &str, message_id: &str) -> bool {
        matches!(self.lookup(room, message_id).await, Ok(Some(_)))
    }

    /// Thread root an inbound email belongs to, if any.
    ///
    /// Candidates are In-Reply-To first, then References in header order; the
    /// first stored hit wins. Lookup failures count as misses.
    pub async fn resolve_thread(&self, room: &str, email: &Email) -> Option<EventId> {
        for candidate in email.thread_candidates() {
            match self.lookup(room, &candidate).await {
                Ok(Some(association)) => {
                    debug!(
                        room = %room,
                        message_id = %email.message_id,
                        candidate = %candidate,
                        root = %association.thread_root,
                        "Resolved email thread"
                    );
                    return Some(association.thread_root);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(room = %room, candidate = %candidate, "Thread lookup failed: {}", e);
                }
            }
        }
        None
    }

    /// Bind a Message-Id to a thread root.
    ///
    /// Returns false without writing when the id is already bound.
    pub async fn record(
        &self,
        room: &str,
        message_id: &str,
        root: &str,
        references: &[String],
    ) -> Result<bool> {
        if message_id.is_empty() {
            return Ok(false);
        }
        let key = message_key(message_id);
        if !self.store.get_scoped(room, &key).await?.is_empty() {
            return Ok(false);
        }

        let mut record = Record::new();
        record.insert(FIELD_ROOT.to_string(), root.to_string());
        if !references.is_empty() {
            record.insert(FIELD_REFERENCES.to_string(), references.join(" "));
        }
        self.store.set_scoped(room, &key, record).await?;
        Ok(true)
    }

    /// Remember the most recent event of a thread
    pub async fn set_last(&self, room: &str, root: &str, event: &str) -> Result<()> {
        let mut record = Record::new();
        record.insert(FIELD_EVENT.to_string(), event.to_string());
        self.store.set_scoped(room, &last_key(root), record).await
    }

    /// Most recent event of a thread, the root itself when nothing newer is known
    pub async fn last_event(&self, room: &str, root: &str) -> EventId {
        match self.store.get_scoped(room, &last_key(root)).await {
            Ok(record) => record
                .get(FIELD_EVENT)
                .filter(|e| !e.is_empty())
                .cloned()
                .unwrap_or_else(|| root.to_string()),
            Err(e) => {
                warn!(room = %room, root = %root, "Failed to read last thread event: {}", e);
                root.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postroom_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    fn reconciler() -> Reconciler {
        Reconciler::new(Arc::new(MemoryStore::new()))
    }

    fn reply(message_id: &str, in_reply_to: &str, references: &[&str]) -> Email {
        Email {
            message_id: message_id.to_string(),
            in_reply_to: in_reply_to.to_string(),
            references: references.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_thread_has_no_root() {
        let r = reconciler();
        assert_eq!(r.resolve_thread("!room", &reply("m1@x", "", &[])).await, None);
    }

    #[tokio::test]
    async fn test_in_reply_to_wins_over_references() {
        let r = reconciler();
        r.record("!room", "m1@x", "$root1", &[]).await.unwrap();
        r.record("!room", "m2@x", "$root2", &[]).await.unwrap();

        let email = reply("m3@x", "m2@x", &["m1@x", "m2@x"]);
        assert_eq!(r.resolve_thread("!room", &email).await, Some("$root2".to_string()));
    }

    #[tokio::test]
    async fn test_deep_reply_resolves_through_references() {
        let r = reconciler();
        r.record("!room", "m1@x", "$root", &[]).await.unwrap();

        let email = reply("m5@x", "m4@unknown", &["m1@x", "m2@x", "m3@x", "m4@unknown"]);
        assert_eq!(r.resolve_thread("!room", &email).await, Some("$root".to_string()));
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let r = reconciler();
        r.record("!room", "m1@x", "$root", &[]).await.unwrap();
        let email = reply("m2@x", "m1@x", &[]);

        let first = r.resolve_thread("!room", &email).await;
        r.record("!room", "other@y", "$other", &[]).await.unwrap();
        assert!(!r.record("!room", "m1@x", "$different", &[]).await.unwrap());
        let second = r.resolve_thread("!room", &email).await;

        assert_eq!(first, Some("$root".to_string()));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_associations_are_room_scoped() {
        let r = reconciler();
        r.record("!a", "m1@x", "$root", &[]).await.unwrap();
        assert!(r.is_known("!a", "m1@x").await);
        assert!(!r.is_known("!b", "m1@x").await);
    }

    #[tokio::test]
    async fn test_last_event_defaults_to_root() {
        let r = reconciler();
        assert_eq!(r.last_event("!room", "$root").await, "$root");
        r.set_last("!room", "$root", "$e2").await.unwrap();
        assert_eq!(r.last_event("!room", "$root").await, "$e2");
    }
}
