//! In-process fakes for the chat network and the outbound transport

use crate::chat::{Attachment, ChatClient, ChatEvent, MessageContent, Relation};
use crate::delivery::{DeliveryError, Transport};
use async_trait::async_trait;
use postroom_common::types::{EventId, RoomId, UserId};
use postroom_common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Email handed to a [`ScriptedTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub from: String,
    pub to: Vec<String>,
    pub data: Vec<u8>,
    pub relay: Option<String>,
}

impl SentEmail {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Transport that records sends and fails on demand
#[derive(Default)]
pub struct ScriptedTransport {
    failure: Mutex<Option<DeliveryError>>,
    attempts: AtomicUsize,
    sent: Mutex<Vec<SentEmail>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send with `error` until [`succeed`](Self::succeed)
    pub fn failing(error: DeliveryError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    pub fn fail_with(&self, error: DeliveryError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn succeed(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Number of send calls so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful sends
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        from: &str,
        to: &[String],
        data: &[u8],
        relay_override: Option<&str>,
    ) -> std::result::Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(SentEmail {
            from: from.to_string(),
            to: to.to_vec(),
            data: data.to_vec(),
            relay: relay_override.map(str::to_string),
        });
        Ok(())
    }
}

/// What a [`RecordingChat`] was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum ChatAction {
    Message {
        room: RoomId,
        event: EventId,
        content: MessageContent,
    },
    Reaction {
        room: RoomId,
        target: EventId,
        key: String,
    },
    File {
        room: RoomId,
        name: String,
        relation: Option<Relation>,
    },
    Join(RoomId),
    Leave(RoomId),
}

#[derive(Default)]
struct ChatState {
    actions: Vec<ChatAction>,
    events: HashMap<(RoomId, EventId), ChatEvent>,
    members: HashMap<RoomId, Vec<UserId>>,
    rooms: Vec<RoomId>,
    next_event: usize,
}

/// Chat client that keeps everything in memory
pub struct RecordingChat {
    user_id: UserId,
    state: Mutex<ChatState>,
}

impl RecordingChat {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            state: Mutex::new(ChatState::default()),
        }
    }

    fn next_event_id(state: &mut ChatState) -> EventId {
        state.next_event += 1;
        format!("$ev{}", state.next_event)
    }

    /// Make an event fetchable, as if someone had posted it
    pub fn insert_event(&self, event: ChatEvent) {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .insert((event.room_id.clone(), event.event_id.clone()), event);
    }

    pub fn set_members(&self, room: &str, members: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state
            .members
            .insert(room.to_string(), members.iter().map(|m| m.to_string()).collect());
        if !state.rooms.iter().any(|r| r == room) {
            state.rooms.push(room.to_string());
        }
    }

    pub fn actions(&self) -> Vec<ChatAction> {
        self.state.lock().unwrap().actions.clone()
    }

    /// Messages sent to `room`, oldest first
    pub fn messages(&self, room: &str) -> Vec<(EventId, MessageContent)> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                ChatAction::Message {
                    room: r,
                    event,
                    content,
                } if r == room => Some((event, content)),
                _ => None,
            })
            .collect()
    }

    /// Reaction keys sent in `room`
    pub fn reactions(&self, room: &str) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                ChatAction::Reaction { room: r, key, .. } if r == room => Some(key),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatClient for RecordingChat {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn send(&self, room: &str, content: &MessageContent) -> Result<EventId> {
        let mut state = self.state.lock().unwrap();
        let event = Self::next_event_id(&mut state);
        state.events.insert(
            (room.to_string(), event.clone()),
            ChatEvent {
                event_id: event.clone(),
                room_id: room.to_string(),
                sender: self.user_id.clone(),
                content: content.clone(),
            },
        );
        state.actions.push(ChatAction::Message {
            room: room.to_string(),
            event: event.clone(),
            content: content.clone(),
        });
        Ok(event)
    }

    async fn send_reaction(&self, room: &str, event: &str, key: &str) -> Result<EventId> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_event_id(&mut state);
        state.actions.push(ChatAction::Reaction {
            room: room.to_string(),
            target: event.to_string(),
            key: key.to_string(),
        });
        Ok(id)
    }

    async fn replace_reaction(
        &self,
        room: &str,
        event: &str,
        _old_reaction: &str,
        key: &str,
    ) -> Result<EventId> {
        self.send_reaction(room, event, key).await
    }

    async fn send_file(
        &self,
        room: &str,
        attachment: &Attachment,
        relation: Option<&Relation>,
    ) -> Result<EventId> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_event_id(&mut state);
        state.actions.push(ChatAction::File {
            room: room.to_string(),
            name: attachment.name.clone(),
            relation: relation.cloned(),
        });
        Ok(id)
    }

    async fn get_event(&self, room: &str, event: &str) -> Result<ChatEvent> {
        self.state
            .lock()
            .unwrap()
            .events
            .get(&(room.to_string(), event.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Event {} not found", event)))
    }

    async fn joined_rooms(&self) -> Result<Vec<RoomId>> {
        Ok(self.state.lock().unwrap().rooms.clone())
    }

    async fn joined_members(&self, room: &str) -> Result<Vec<UserId>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .members
            .get(room)
            .cloned()
            .unwrap_or_default())
    }

    async fn join(&self, room: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.actions.push(ChatAction::Join(room.to_string()));
        if !state.rooms.iter().any(|r| r == room) {
            state.rooms.push(room.to_string());
        }
        Ok(())
    }

    async fn leave(&self, room: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.actions.push(ChatAction::Leave(room.to_string()));
        state.rooms.retain(|r| r != room);
        Ok(())
    }
}
