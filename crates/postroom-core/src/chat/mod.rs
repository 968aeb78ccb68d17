//! Chat transport boundary
//!
//! The bridge never speaks the chat wire protocol directly; it goes through
//! [`ChatClient`]. [`MatrixClient`] is the client-server HTTP implementation.

mod dispatcher;
mod matrix;

pub use dispatcher::{ChatHandler, Dispatcher};
pub use matrix::{content_from_json, content_to_json, MatrixClient, SyncBatch, FIELD_NAMESPACE};

use async_trait::async_trait;
use postroom_common::types::{EventId, RoomId, UserId};
use postroom_common::Result;
use std::collections::BTreeMap;

/// Kind of a room message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Notice,
    File,
}

/// How a message relates to earlier ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// Part of a thread rooted at `root`
    Thread {
        root: EventId,
        reply_to: Option<EventId>,
    },
    /// Plain reply to a single event
    Reply { event: EventId },
}

impl Relation {
    /// Root of the thread, or the replied-to event for plain replies
    pub fn anchor(&self) -> &str {
        match self {
            Relation::Thread { root, .. } => root,
            Relation::Reply { event } => event,
        }
    }
}

/// Content of a room message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContent {
    pub kind: MessageKind,
    pub body: String,
    pub formatted_body: Option<String>,
    pub relation: Option<Relation>,
    /// Custom fields persisted alongside the message
    pub fields: BTreeMap<String, String>,
}

impl MessageContent {
    /// Plain text message
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            body: body.into(),
            formatted_body: None,
            relation: None,
            fields: BTreeMap::new(),
        }
    }

    /// Bot notice
    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Notice,
            ..Self::text(body)
        }
    }

    /// Attach a relation
    pub fn with_relation(mut self, relation: Option<Relation>) -> Self {
        self.relation = relation;
        self
    }

    /// Attach persisted fields
    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields = fields;
        self
    }
}

/// A message event read back from a room
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub sender: UserId,
    pub content: MessageContent,
}

/// File uploaded into a room
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Membership transition observed in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Invite,
    Join,
    Leave,
}

/// Membership event
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipEvent {
    pub room_id: RoomId,
    /// User whose membership changed
    pub user_id: UserId,
    /// User who caused the change
    pub sender: UserId,
    pub membership: Membership,
}

/// Operations the bridge needs from the chat network
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// The bridge's own user id
    fn user_id(&self) -> &str;

    /// Send a message, returning its event id
    async fn send(&self, room: &str, content: &MessageContent) -> Result<EventId>;

    /// React to an event
    async fn send_reaction(&self, room: &str, event: &str, key: &str) -> Result<EventId>;

    /// Remove `old_reaction` and react to `event` with `key` instead
    async fn replace_reaction(
        &self,
        room: &str,
        event: &str,
        old_reaction: &str,
        key: &str,
    ) -> Result<EventId>;

    /// Upload and send a file
    async fn send_file(
        &self,
        room: &str,
        attachment: &Attachment,
        relation: Option<&Relation>,
    ) -> Result<EventId>;

    /// Fetch a message event
    async fn get_event(&self, room: &str, event: &str) -> Result<ChatEvent>;

    /// Rooms the bridge has joined
    async fn joined_rooms(&self) -> Result<Vec<RoomId>>;

    /// Currently joined members of a room
    async fn joined_members(&self, room: &str) -> Result<Vec<UserId>>;

    /// Join a room
    async fn join(&self, room: &str) -> Result<()>;

    /// Leave a room
    async fn leave(&self, room: &str) -> Result<()>;
}
