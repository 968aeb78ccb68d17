//! Room and bot settings
//!
//! Typed views over the string records kept in the store. Unreadable
//! settings degrade to defaults with a warning instead of failing the
//! caller.

use postroom_common::types::normalize_mailbox;
use postroom_common::Result;
use postroom_storage::{KvStore, Record};
use tracing::warn;

/// Store key of the per-room config blob
pub const ROOM_CONFIG_KEY: &str = "room.config";

/// Store key of the bot-wide config blob
pub const BOT_CONFIG_KEY: &str = "bot.config";

pub const ROOM_MAILBOX: &str = "mailbox";
pub const ROOM_ALIASES: &str = "aliases";
pub const ROOM_OWNER: &str = "owner";
pub const ROOM_STOPPED: &str = "stop";
pub const ROOM_PASSWORD: &str = "password";
pub const ROOM_NOSEND: &str = "nosend";
pub const ROOM_NOSENDER: &str = "nosender";
pub const ROOM_NORECIPIENT: &str = "norecipient";
pub const ROOM_NOCC: &str = "nocc";
pub const ROOM_NOSUBJECT: &str = "nosubject";
pub const ROOM_NOHTML: &str = "nohtml";
pub const ROOM_NOTHREADS: &str = "nothreads";
pub const ROOM_NOFILES: &str = "nofiles";
pub const ROOM_RELAY: &str = "relay";
pub const ROOM_SPAMCHECK_DKIM: &str = "spamcheck:dkim";
pub const ROOM_SPAMCHECK_MX: &str = "spamcheck:mx";
pub const ROOM_SPAMCHECK_SMTP: &str = "spamcheck:smtp";
pub const ROOM_SPAMCHECK_SPF: &str = "spamcheck:spf";
pub const ROOM_SPAMLIST: &str = "spamlist";

pub const BOT_CATCH_ALL: &str = "catch-all";
pub const BOT_ADMIN_ROOM: &str = "adminroom";
pub const BOT_GREYLIST: &str = "greylist";
pub const BOT_BANLIST: &str = "banlist";
pub const BOT_BANLIST_AUTO: &str = "banlist:auto";
pub const BOT_QUEUE_BATCH: &str = "queue:batch";
pub const BOT_QUEUE_RETRIES: &str = "queue:retries";

const DEFAULT_QUEUE_BATCH: usize = 10;
const DEFAULT_QUEUE_RETRIES: u32 = 10;

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_true(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "on" | "yes" | "1")
}

/// Settings of one room
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSettings(Record);

impl RoomSettings {
    /// Wrap a stored record
    pub fn from_record(record: Record) -> Self {
        Self(record)
    }

    /// Unwrap into a record for storage
    pub fn into_record(self) -> Record {
        self.0
    }

    /// Raw value of an option, empty when unset
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or_default()
    }

    /// Set an option; an empty value unsets it
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.0.remove(key);
        } else {
            self.0.insert(key.to_string(), value);
        }
    }

    /// Boolean option
    pub fn flag(&self, key: &str) -> bool {
        is_true(self.get(key))
    }

    pub fn mailbox(&self) -> Option<String> {
        let mailbox = normalize_mailbox(self.get(ROOM_MAILBOX));
        (!mailbox.is_empty()).then_some(mailbox)
    }

    pub fn aliases(&self) -> Vec<String> {
        split_list(self.get(ROOM_ALIASES))
            .iter()
            .map(|a| normalize_mailbox(a))
            .collect()
    }

    pub fn set_aliases(&mut self, aliases: &[String]) {
        self.set(ROOM_ALIASES, aliases.join(","));
    }

    pub fn owner(&self) -> &str {
        self.get(ROOM_OWNER)
    }

    /// A room with a mailbox that has not been stopped
    pub fn active(&self) -> bool {
        self.mailbox().is_some() && !self.flag(ROOM_STOPPED)
    }

    pub fn password_hash(&self) -> Option<&str> {
        let hash = self.get(ROOM_PASSWORD);
        (!hash.is_empty()).then_some(hash)
    }

    pub fn nosend(&self) -> bool {
        self.flag(ROOM_NOSEND)
    }

    pub fn relay(&self) -> Option<&str> {
        let relay = self.get(ROOM_RELAY);
        (!relay.is_empty()).then_some(relay)
    }

    pub fn spam_patterns(&self) -> Vec<String> {
        split_list(self.get(ROOM_SPAMLIST))
    }

    pub fn set_spam_patterns(&mut self, patterns: &[String]) {
        self.set(ROOM_SPAMLIST, patterns.join(","));
    }

    /// Display options for rendering inbound email
    pub fn display(&self) -> DisplayOptions {
        DisplayOptions {
            sender: !self.flag(ROOM_NOSENDER),
            recipient: !self.flag(ROOM_NORECIPIENT),
            cc: !self.flag(ROOM_NOCC),
            subject: !self.flag(ROOM_NOSUBJECT),
            html: !self.flag(ROOM_NOHTML),
            threads: !self.flag(ROOM_NOTHREADS),
            files: !self.flag(ROOM_NOFILES),
        }
    }

    /// Sender checks enabled for the room
    pub fn sender_checks(&self) -> SenderChecks {
        SenderChecks {
            dkim: self.flag(ROOM_SPAMCHECK_DKIM),
            mx: self.flag(ROOM_SPAMCHECK_MX),
            smtp: self.flag(ROOM_SPAMCHECK_SMTP),
            spf: self.flag(ROOM_SPAMCHECK_SPF),
        }
    }
}

/// What parts of an email a room wants to see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayOptions {
    pub sender: bool,
    pub recipient: bool,
    pub cc: bool,
    pub subject: bool,
    pub html: bool,
    pub threads: bool,
    pub files: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        RoomSettings::default().display()
    }
}

/// Sender validation switches of a room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderChecks {
    pub dkim: bool,
    pub mx: bool,
    pub smtp: bool,
    pub spf: bool,
}

impl SenderChecks {
    pub fn any(&self) -> bool {
        self.dkim || self.mx || self.smtp || self.spf
    }
}

/// Bot-wide settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotSettings(Record);

impl BotSettings {
    pub fn from_record(record: Record) -> Self {
        Self(record)
    }

    pub fn into_record(self) -> Record {
        self.0
    }

    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.0.remove(key);
        } else {
            self.0.insert(key.to_string(), value);
        }
    }

    pub fn catch_all(&self) -> Option<String> {
        let mailbox = normalize_mailbox(self.get(BOT_CATCH_ALL));
        (!mailbox.is_empty()).then_some(mailbox)
    }

    pub fn admin_room(&self) -> Option<&str> {
        let room = self.get(BOT_ADMIN_ROOM);
        (!room.is_empty()).then_some(room)
    }

    /// Greylist window in minutes; zero disables greylisting
    pub fn greylist_minutes(&self) -> u64 {
        self.get(BOT_GREYLIST).trim().parse().unwrap_or(0)
    }

    pub fn banlist_enabled(&self) -> bool {
        is_true(self.get(BOT_BANLIST))
    }

    pub fn banlist_auto(&self) -> bool {
        is_true(self.get(BOT_BANLIST_AUTO))
    }

    pub fn queue_batch(&self) -> usize {
        self.get(BOT_QUEUE_BATCH)
            .trim()
            .parse()
            .unwrap_or(DEFAULT_QUEUE_BATCH)
    }

    pub fn queue_retries(&self) -> u32 {
        self.get(BOT_QUEUE_RETRIES)
            .trim()
            .parse()
            .unwrap_or(DEFAULT_QUEUE_RETRIES)
    }
}

/// Read a room's settings, falling back to defaults when unreadable
pub async fn load_room(store: &dyn KvStore, room: &str) -> RoomSettings {
    match store.get_scoped(room, ROOM_CONFIG_KEY).await {
        Ok(record) => RoomSettings::from_record(record),
        Err(e) => {
            warn!(room = %room, "Failed to read room settings: {}", e);
            RoomSettings::default()
        }
    }
}

/// Persist a room's settings
pub async fn save_room(store: &dyn KvStore, room: &str, settings: RoomSettings) -> Result<()> {
    store
        .set_scoped(room, ROOM_CONFIG_KEY, settings.into_record())
        .await
}

/// Read the bot settings, falling back to defaults when unreadable
pub async fn load_bot(store: &dyn KvStore) -> BotSettings {
    match store.get(BOT_CONFIG_KEY).await {
        Ok(record) => BotSettings::from_record(record),
        Err(e) => {
            warn!("Failed to read bot settings: {}", e);
            BotSettings::default()
        }
    }
}

/// Persist the bot settings
pub async fn save_bot(store: &dyn KvStore, settings: BotSettings) -> Result<()> {
    store.set(BOT_CONFIG_KEY, settings.into_record()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use postroom_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_room_defaults() {
        let room = RoomSettings::default();
        assert!(room.mailbox().is_none());
        assert!(!room.active());
        assert!(!room.nosend());
        assert!(room.display().threads);
        assert!(!room.sender_checks().any());
    }

    #[test]
    fn test_room_options() {
        let mut room = RoomSettings::default();
        room.set(ROOM_MAILBOX, " Sales ");
        room.set(ROOM_ALIASES, "shop, Store,,");
        room.set(ROOM_NOHTML, "true");
        room.set(ROOM_SPAMCHECK_SPF, "on");

        assert_eq!(room.mailbox(), Some("sales".to_string()));
        assert_eq!(room.aliases(), vec!["shop", "store"]);
        assert!(room.active());
        assert!(!room.display().html);
        assert!(room.sender_checks().spf);

        room.set(ROOM_STOPPED, "true");
        assert!(!room.active());

        room.set(ROOM_NOHTML, "");
        assert!(room.display().html);
    }

    #[test]
    fn test_bot_defaults() {
        let bot = BotSettings::default();
        assert_eq!(bot.greylist_minutes(), 0);
        assert!(!bot.banlist_enabled());
        assert_eq!(bot.queue_batch(), 10);
        assert_eq!(bot.queue_retries(), 10);

        let mut bot = bot;
        bot.set(BOT_QUEUE_RETRIES, "not a number");
        assert_eq!(bot.queue_retries(), 10);
    }

    #[tokio::test]
    async fn test_load_and_save() {
        let store = MemoryStore::new();
        let mut room = RoomSettings::default();
        room.set(ROOM_MAILBOX, "support");
        save_room(&store, "!a", room.clone()).await.unwrap();

        assert_eq!(load_room(&store, "!a").await, room);
        assert_eq!(load_room(&store, "!b").await, RoomSettings::default());

        let mut bot = BotSettings::default();
        bot.set(BOT_GREYLIST, "5");
        save_bot(&store, bot).await.unwrap();
        assert_eq!(load_bot(&store).await.greylist_minutes(), 5);
    }
}
