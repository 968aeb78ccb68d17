//! Inbound email into rooms

use super::Bridge;
use crate::chat::Relation;
use crate::email::Email;
use crate::guard::bare_ip;
use crate::settings::{self, RoomSettings};
use postroom_common::types::{wildcard_match, EmailAddress, Envelope};
use postroom_common::{Error, Result};
use std::net::IpAddr;
use tracing::{debug, info, warn};

impl Bridge {
    /// Deliver an email accepted by the SMTP listener to the rooms of its recipients.
    ///
    /// Fails only when no room took the email.
    pub async fn incoming_email(&self, envelope: &Envelope, raw: &[u8]) -> Result<()> {
        let mut delivered = 0usize;
        let mut rooms = Vec::new();
        let mut last_error = None;

        for rcpt in &envelope.to {
            let rcpt = rcpt.to_string().to_lowercase();
            let Some(room) = self.resolve(&rcpt).await else {
                debug!(rcpt = %rcpt, "No room for recipient");
                continue;
            };
            if rooms.contains(&room) {
                continue;
            }
            rooms.push(room.clone());

            match self.deliver_to_room(&room, &rcpt, envelope, raw).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(room = %room, rcpt = %rcpt, "Email not delivered to room: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match (delivered, last_error) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(Error::NotFound("No such mailbox".to_string())),
            _ => Ok(()),
        }
    }

    async fn deliver_to_room(
        &self,
        room: &str,
        rcpt: &str,
        envelope: &Envelope,
        raw: &[u8],
    ) -> Result<()> {
        let room_settings = settings::load_room(self.store.as_ref(), room).await;
        let envelope_from = envelope.from.as_ref().map(|a| a.to_string());
        let email = Email::parse(raw, envelope_from.as_deref(), rcpt)?;

        let sender = envelope
            .from
            .clone()
            .or_else(|| email.from.first().and_then(|f| EmailAddress::parse(f)));
        if let Some(sender) = &sender {
            if self.is_spam(room, &room_settings, sender) {
                return Ok(());
            }
            self.validate_sender(room, &room_settings, sender, envelope, raw)
                .await?;
        }

        let display = room_settings.display();
        let _room_lock = self.locks.lock(room).await;

        if self.reconciler.is_known(room, &email.message_id).await {
            info!(room = %room, message_id = %email.message_id, "Skipping already delivered email");
            return Ok(());
        }

        let root = self.reconciler.resolve_thread(room, &email).await;
        let relation = match &root {
            Some(root) => {
                let last = self.reconciler.last_event(room, root).await;
                Some(if display.threads {
                    Relation::Thread {
                        root: root.clone(),
                        reply_to: Some(last),
                    }
                } else {
                    Relation::Reply { event: last }
                })
            }
            None => None,
        };

        let event = self
            .chat
            .send(room, &email.content(&display, relation))
            .await?;
        let root = root.unwrap_or_else(|| event.clone());

        if display.files && !email.attachments.is_empty() {
            let file_relation = if display.threads {
                Relation::Thread {
                    root: root.clone(),
                    reply_to: Some(event.clone()),
                }
            } else {
                Relation::Reply {
                    event: event.clone(),
                }
            };
            for attachment in &email.attachments {
                if let Err(e) = self
                    .chat
                    .send_file(room, attachment, Some(&file_relation))
                    .await
                {
                    warn!(room = %room, file = %attachment.name, "Failed to upload attachment: {}", e);
                }
            }
        }

        self.reconciler
            .record(room, &email.message_id, &root, &email.references)
            .await?;
        self.reconciler.set_last(room, &root, &event).await?;

        info!(
            room = %room,
            event = %event,
            message_id = %email.message_id,
            root = %root,
            "Email delivered to room"
        );
        Ok(())
    }

    fn is_spam(&self, room: &str, room_settings: &RoomSettings, sender: &EmailAddress) -> bool {
        let address = sender.to_string().to_lowercase();
        match room_settings
            .spam_patterns()
            .into_iter()
            .find(|pattern| wildcard_match(pattern, &address))
        {
            Some(pattern) => {
                info!(room = %room, sender = %address, pattern = %pattern, "Dropping email matching spam pattern");
                true
            }
            None => false,
        }
    }

    async fn validate_sender(
        &self,
        room: &str,
        room_settings: &RoomSettings,
        sender: &EmailAddress,
        envelope: &Envelope,
        raw: &[u8],
    ) -> Result<()> {
        let checks = room_settings.sender_checks();
        if !checks.any() {
            return Ok(());
        }
        let Some(validator) = &self.validator else {
            warn!(room = %room, "Sender checks requested but no validator is configured");
            return Ok(());
        };

        let client_ip = envelope
            .client_addr
            .as_deref()
            .and_then(|addr| bare_ip(addr).parse::<IpAddr>().ok());
        validator
            .validate(checks, sender, client_ip, raw)
            .await
            .map_err(|reason| {
                info!(room = %room, sender = %sender, "Sender rejected: {}", reason);
                Error::Validation(reason)
            })
    }
}
