//! Mailbox registry
//!
//! Derived cache from mailbox names and aliases to rooms. It owns nothing:
//! room settings are the source of truth and the registry can be rebuilt
//! from them at any time.

use postroom_common::types::{normalize_mailbox, RoomId, UserId};
use postroom_common::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Mailbox claimed by a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxBinding {
    pub name: String,
    pub room_id: RoomId,
    pub active: bool,
    pub aliases: Vec<String>,
    pub owner: UserId,
}

impl MailboxBinding {
    /// Active binding without aliases
    pub fn new(name: &str, room_id: &str) -> Self {
        Self {
            name: normalize_mailbox(name),
            room_id: room_id.to_string(),
            active: true,
            aliases: Vec::new(),
            owner: UserId::new(),
        }
    }

    fn names(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.name.clone()).chain(self.aliases.iter().map(|a| normalize_mailbox(a)))
    }
}

#[derive(Default)]
struct RegistryState {
    /// Bindings by room
    bindings: HashMap<RoomId, MailboxBinding>,
    /// Active names and aliases
    index: HashMap<String, RoomId>,
    catch_all: Option<String>,
    admin_rooms: Vec<RoomId>,
}

impl RegistryState {
    fn taken_by_other(&self, name: &str, room_id: &str) -> bool {
        self.index.get(name).is_some_and(|owner| owner != room_id)
    }

    fn unindex_room(&mut self, room_id: &str) {
        self.index.retain(|_, room| room != room_id);
    }

    fn insert(&mut self, binding: MailboxBinding) {
        self.unindex_room(&binding.room_id);
        if binding.active {
            for name in binding.names() {
                self.index.insert(name, binding.room_id.clone());
            }
        }
        self.bindings.insert(binding.room_id.clone(), binding);
    }
}

/// Mailbox name to room lookup
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a mailbox and its aliases to a room.
    ///
    /// Fails if any of the names is held by another room's active binding.
    /// A room re-registering replaces its previous binding.
    pub async fn register(&self, binding: MailboxBinding) -> Result<()> {
        let mut state = self.state.write().await;

        if binding.active {
            if let Some(name) = binding
                .names()
                .find(|name| state.taken_by_other(name, &binding.room_id))
            {
                return Err(Error::Validation(format!(
                    "Mailbox {} is already taken",
                    name
                )));
            }
        }

        info!(mailbox = %binding.name, room = %binding.room_id, "Registered mailbox");
        state.insert(binding);
        Ok(())
    }

    /// Whether `name` could be claimed by `room_id`
    pub async fn is_available(&self, name: &str, room_id: &str) -> bool {
        let name = normalize_mailbox(name);
        !self.state.read().await.taken_by_other(&name, room_id)
    }

    /// Find the room for a mailbox, falling back to the catch-all mailbox
    pub async fn resolve(&self, name: &str) -> Option<RoomId> {
        let name = normalize_mailbox(name);
        let state = self.state.read().await;

        if let Some(room) = state.index.get(&name) {
            return Some(room.clone());
        }

        let catch_all = state.catch_all.as_ref()?;
        let room = state.index.get(catch_all).cloned();
        if room.is_some() {
            debug!(mailbox = %name, catch_all = %catch_all, "Resolved via catch-all");
        }
        room
    }

    /// Deactivate the binding that owns `name`, freeing it and its aliases
    pub async fn deactivate(&self, name: &str) -> bool {
        let name = normalize_mailbox(name);
        let mut state = self.state.write().await;

        let Some(room_id) = state.index.get(&name).cloned() else {
            return false;
        };
        state.unindex_room(&room_id);
        if let Some(binding) = state.bindings.get_mut(&room_id) {
            binding.active = false;
        }

        info!(mailbox = %name, room = %room_id, "Deactivated mailbox");
        true
    }

    /// Drop whatever binding a room has
    pub async fn remove_room(&self, room_id: &str) {
        let mut state = self.state.write().await;
        state.unindex_room(room_id);
        state.bindings.remove(room_id);
    }

    /// Replace the whole registry state.
    ///
    /// Conflicting bindings are resolved in favor of the first one seen.
    pub async fn rebuild(
        &self,
        bindings: Vec<MailboxBinding>,
        admin_rooms: Vec<RoomId>,
        catch_all: Option<String>,
    ) {
        let mut fresh = RegistryState {
            catch_all: catch_all.map(|c| normalize_mailbox(&c)),
            admin_rooms,
            ..Default::default()
        };

        for binding in bindings {
            if binding.active {
                if let Some(name) = binding
                    .names()
                    .find(|name| fresh.taken_by_other(name, &binding.room_id))
                {
                    warn!(mailbox = %name, room = %binding.room_id, "Skipping conflicting mailbox");
                    continue;
                }
            }
            fresh.insert(binding);
        }

        let count = fresh.index.len();
        *self.state.write().await = fresh;
        info!("Registry rebuilt with {} mailbox names", count);
    }

    pub async fn set_catch_all(&self, mailbox: Option<String>) {
        self.state.write().await.catch_all = mailbox.map(|m| normalize_mailbox(&m));
    }

    /// Binding of a room, active or not
    pub async fn binding_of(&self, room_id: &str) -> Option<MailboxBinding> {
        self.state.read().await.bindings.get(room_id).cloned()
    }

    /// All bindings sorted by name
    pub async fn bindings(&self) -> Vec<MailboxBinding> {
        let mut bindings: Vec<MailboxBinding> =
            self.state.read().await.bindings.values().cloned().collect();
        bindings.sort_by(|a, b| a.name.cmp(&b.name));
        bindings
    }

    /// Rooms owned by administrators
    pub async fn admin_rooms(&self) -> Vec<RoomId> {
        self.state.read().await.admin_rooms.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_mailbox_uniqueness() {
        let registry = Registry::new();
        registry
            .register(MailboxBinding::new("sales", "!a"))
            .await
            .unwrap();

        let taken = registry.register(MailboxBinding::new("sales", "!b")).await;
        assert!(matches!(taken, Err(Error::Validation(_))));
        assert_eq!(registry.resolve("sales").await, Some("!a".to_string()));

        assert!(registry.deactivate("sales").await);
        registry
            .register(MailboxBinding::new("sales", "!b"))
            .await
            .unwrap();
        assert_eq!(registry.resolve("SALES").await, Some("!b".to_string()));
    }

    #[tokio::test]
    async fn test_aliases_and_rename() {
        let registry = Registry::new();
        let mut binding = MailboxBinding::new("support", "!a");
        binding.aliases = vec!["help".to_string()];
        registry.register(binding).await.unwrap();

        assert_eq!(registry.resolve("help").await, Some("!a".to_string()));
        assert!(!registry.is_available("help", "!b").await);
        assert!(registry.is_available("help", "!a").await);

        registry
            .register(MailboxBinding::new("care", "!a"))
            .await
            .unwrap();
        assert_eq!(registry.resolve("support").await, None);
        assert_eq!(registry.resolve("help").await, None);
        assert_eq!(registry.resolve("care").await, Some("!a".to_string()));
    }

    #[tokio::test]
    async fn test_alias_conflict_is_rejected() {
        let registry = Registry::new();
        registry
            .register(MailboxBinding::new("sales", "!a"))
            .await
            .unwrap();

        let mut binding = MailboxBinding::new("shop", "!b");
        binding.aliases = vec!["sales".to_string()];
        assert!(registry.register(binding).await.is_err());
        assert_eq!(registry.resolve("shop").await, None);
    }

    #[tokio::test]
    async fn test_catch_all() {
        let registry = Registry::new();
        registry
            .register(MailboxBinding::new("inbox", "!a"))
            .await
            .unwrap();

        assert_eq!(registry.resolve("anything").await, None);
        registry.set_catch_all(Some("inbox".to_string())).await;
        assert_eq!(registry.resolve("anything").await, Some("!a".to_string()));
    }

    #[tokio::test]
    async fn test_rebuild_replaces_state() {
        let registry = Registry::new();
        registry
            .register(MailboxBinding::new("old", "!x"))
            .await
            .unwrap();

        let mut stopped = MailboxBinding::new("paused", "!c");
        stopped.active = false;
        registry
            .rebuild(
                vec![
                    MailboxBinding::new("sales", "!a"),
                    MailboxBinding::new("sales", "!b"),
                    stopped,
                ],
                vec!["!admin".to_string()],
                None,
            )
            .await;

        assert_eq!(registry.resolve("old").await, None);
        assert_eq!(registry.resolve("sales").await, Some("!a".to_string()));
        assert_eq!(registry.resolve("paused").await, None);
        assert_eq!(registry.bindings().await.len(), 2);
        assert_eq!(registry.admin_rooms().await, vec!["!admin".to_string()]);

        // rebuilding twice yields the same result
        registry
            .rebuild(
                vec![MailboxBinding::new("sales", "!a")],
                Vec::new(),
                None,
            )
            .await;
        assert_eq!(registry.resolve("sales").await, Some("!a".to_string()));
    }
}
