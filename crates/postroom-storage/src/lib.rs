//! Postroom Storage - Keyed durable store
//!
//! Every piece of persistent bridge state (bot and room configuration,
//! thread associations, the delivery queue, the greylist and banlist) is a
//! string map stored under a key, optionally scoped to a room.

pub mod db;
pub mod kv;
pub mod memory;

pub use db::{DatabasePool, DbStore};
pub use kv::{create_store, KvStore, Record};
pub use memory::MemoryStore;
