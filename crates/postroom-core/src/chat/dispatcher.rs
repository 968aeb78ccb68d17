//! Event dispatcher
//!
//! Each event type has its own channel and consumer loop. Every event is
//! handled on its own task, so a slow handler never stalls the sync loop and
//! there is no ordering between message and membership events.

use super::{ChatEvent, MembershipEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;

/// Receives dispatched chat events
#[async_trait]
pub trait ChatHandler: Send + Sync + 'static {
    /// A new room message
    async fn on_message(&self, event: ChatEvent);

    /// A membership change
    async fn on_membership(&self, event: MembershipEvent);
}

/// Producer side of the dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    messages: mpsc::Sender<ChatEvent>,
    memberships: mpsc::Sender<MembershipEvent>,
}

impl Dispatcher {
    /// Spawn the consumer loops and return the producer handle
    pub fn start(handler: Arc<dyn ChatHandler>) -> Self {
        let (messages, mut message_rx) = mpsc::channel::<ChatEvent>(CHANNEL_CAPACITY);
        let (memberships, mut membership_rx) = mpsc::channel::<MembershipEvent>(CHANNEL_CAPACITY);

        let message_handler = handler.clone();
        tokio::spawn(async move {
            while let Some(event) = message_rx.recv().await {
                let handler = message_handler.clone();
                tokio::spawn(async move { handler.on_message(event).await });
            }
            debug!("Message dispatcher stopped");
        });

        tokio::spawn(async move {
            while let Some(event) = membership_rx.recv().await {
                let handler = handler.clone();
                tokio::spawn(async move { handler.on_membership(event).await });
            }
            debug!("Membership dispatcher stopped");
        });

        Self {
            messages,
            memberships,
        }
    }

    /// Queue a room message
    pub async fn push_message(&self, event: ChatEvent) {
        if let Err(e) = self.messages.send(event).await {
            warn!(event = %e.0.event_id, "Message dispatcher is closed");
        }
    }

    /// Queue a membership event
    pub async fn push_membership(&self, event: MembershipEvent) {
        if let Err(e) = self.memberships.send(event).await {
            warn!(room = %e.0.room_id, "Membership dispatcher is closed");
        }
    }
}
