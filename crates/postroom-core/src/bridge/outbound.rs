//! Outbound email from rooms

use super::{Bridge, DONE_MARKER, FAILED_MARKER};
use crate::chat::{ChatEvent, MessageContent, Relation};
use crate::delivery::{group_by_domain, DeliveryError};
use crate::email::{sign_or_passthrough, strip_quoted_reply, Email, OutgoingEmail};
use crate::settings::{self, RoomSettings};
use crate::threads::{message_id_for, Correspondents, PreviousTurn};
use postroom_common::types::{normalize_mailbox, EmailAddress, Envelope};
use postroom_common::{Error, Result};
use tracing::{error, info, warn};
use uuid::Uuid;

/// What happened to each recipient of one outbound email
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: Vec<String>,
    pub queued: Vec<String>,
    /// Recipient and reason
    pub failed: Vec<(String, String)>,
}

impl DeliveryReport {
    /// Whether any recipient was sent to or queued
    pub fn accepted(&self) -> bool {
        !self.sent.is_empty() || !self.queued.is_empty()
    }

    /// One line per outcome, for notices
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if !self.sent.is_empty() {
            lines.push(format!("Email sent to {}", self.sent.join(", ")));
        }
        if !self.queued.is_empty() {
            lines.push(format!(
                "Delivery to {} failed temporarily, queued for retry",
                self.queued.join(", ")
            ));
        }
        for (rcpt, reason) in &self.failed {
            lines.push(format!("Delivery to {} failed: {}", rcpt, reason));
        }
        lines.join("\n")
    }
}

/// Relation for bot notices that continue a turn
fn turn_relation(threads: bool, root: &str, reply_to: &str) -> Relation {
    if threads {
        Relation::Thread {
            root: root.to_string(),
            reply_to: Some(reply_to.to_string()),
        }
    } else {
        Relation::Reply {
            event: reply_to.to_string(),
        }
    }
}

impl Bridge {
    /// Send `data` to `recipients`, queueing transient failures.
    ///
    /// With a relay everything goes out as one transaction, otherwise one
    /// transaction per recipient domain.
    pub async fn deliver(
        &self,
        from: &str,
        recipients: &[String],
        data: &[u8],
        relay: Option<&str>,
    ) -> DeliveryReport {
        let relayed = relay.is_some()
            || self
                .mail
                .relay
                .as_deref()
                .is_some_and(|r| !r.trim().is_empty());
        let batches = if relayed {
            vec![recipients.to_vec()]
        } else {
            group_by_domain(recipients)
        };

        let mut report = DeliveryReport::default();
        for batch in batches.into_iter().filter(|b| !b.is_empty()) {
            match self.transport.send(from, &batch, data, relay).await {
                Ok(()) => report.sent.extend(batch),
                Err(DeliveryError::Transient(reason)) => {
                    let id = Uuid::now_v7().to_string();
                    match self.queue.add(&id, from, &batch, data, relay).await {
                        Ok(()) => {
                            info!(queue_item = %id, to = ?batch, "Transient failure, email queued: {}", reason);
                            report.queued.extend(batch);
                        }
                        Err(e) => {
                            error!(to = ?batch, "Failed to queue email: {}", e);
                            report.failed.extend(
                                batch
                                    .into_iter()
                                    .map(|rcpt| (rcpt, format!("{} (not queued: {})", reason, e))),
                            );
                        }
                    }
                }
                Err(DeliveryError::Permanent(reason)) => {
                    warn!(from = %from, to = ?batch, "Permanent delivery failure: {}", reason);
                    report
                        .failed
                        .extend(batch.into_iter().map(|rcpt| (rcpt, reason.clone())));
                }
            }
        }
        report
    }

    /// Email a room member's threaded reply to the correspondents of the thread
    pub async fn send_reply(&self, event: &ChatEvent) -> Result<()> {
        let room = event.room_id.as_str();
        let Some(relation) = &event.content.relation else {
            return Ok(());
        };
        let room_settings = settings::load_room(self.store.as_ref(), room).await;
        let Some(mailbox) = room_settings.mailbox().filter(|_| room_settings.active()) else {
            return Ok(());
        };
        if room_settings.nosend() {
            self.notice(
                room,
                MessageContent::notice("Sending email is disabled in this room.")
                    .with_relation(Some(relation.clone())),
            )
            .await;
            return Ok(());
        }

        let _room_lock = self.locks.lock(room).await;
        let marker = self.mark_processing(room, &event.event_id).await;
        let result = self
            .compose_reply(event, relation, &room_settings, &mailbox)
            .await;
        let key = match &result {
            Ok(true) => DONE_MARKER,
            _ => FAILED_MARKER,
        };
        self.mark_finished(room, &event.event_id, marker, key).await;
        result.map(|_| ())
    }

    async fn compose_reply(
        &self,
        event: &ChatEvent,
        relation: &Relation,
        room_settings: &RoomSettings,
        mailbox: &str,
    ) -> Result<bool> {
        let room = event.room_id.as_str();
        let threads = matches!(relation, Relation::Thread { .. });
        let root = relation.anchor().to_string();
        let notice_relation = turn_relation(threads, &root, &event.event_id);

        let previous_event = self.reconciler.last_event(room, &root).await;
        let previous = match self.chat.get_event(room, &previous_event).await {
            Ok(previous) => PreviousTurn::from_fields(&previous.content.fields),
            Err(e) => {
                warn!(room = %room, event = %previous_event, "Failed to fetch previous turn: {}", e);
                None
            }
        };
        let Some(previous) = previous else {
            self.notice(
                room,
                MessageContent::notice(format!(
                    "There is no email to reply to here. Start a new thread with `{} send`.",
                    self.prefix
                ))
                .with_relation(Some(notice_relation)),
            )
            .await;
            return Ok(false);
        };

        let mut names = vec![mailbox.to_string()];
        names.extend(room_settings.aliases());
        let correspondents = Correspondents::reverse(
            &previous,
            &names,
            &self.mail.domains,
            &previous_event,
            &event.event_id,
        );
        if correspondents.recipients.is_empty() {
            self.notice(
                room,
                MessageContent::notice("Nobody to send this reply to.")
                    .with_relation(Some(notice_relation)),
            )
            .await;
            return Ok(false);
        }

        let text = strip_quoted_reply(&event.content.body);
        let html = event
            .content
            .formatted_body
            .as_deref()
            .map(strip_quoted_reply)
            .filter(|h| !h.is_empty());
        let domain = correspondents.from_domain.clone();
        let email = correspondents.into_email(text, html);

        let data = sign_or_passthrough(self.dkim.as_ref(), &domain, email.to_message()?);
        let report = self
            .deliver(&email.from, &email.recipients, &data, room_settings.relay())
            .await;
        self.finish_turn(room, &root, notice_relation, &email, &report)
            .await
    }

    /// Start a new email thread from a `send` command
    pub(crate) async fn send_new(
        &self,
        event: &ChatEvent,
        to: Vec<String>,
        subject: String,
        body: String,
    ) -> Result<()> {
        let room = event.room_id.as_str();
        let room_settings = settings::load_room(self.store.as_ref(), room).await;
        let Some(mailbox) = room_settings.mailbox().filter(|_| room_settings.active()) else {
            self.notice(room, MessageContent::notice("This room has no active mailbox."))
                .await;
            return Ok(());
        };
        if room_settings.nosend() {
            self.notice(room, MessageContent::notice("Sending email is disabled in this room."))
                .await;
            return Ok(());
        }

        let _room_lock = self.locks.lock(room).await;
        let marker = self.mark_processing(room, &event.event_id).await;

        let domain = self.mail.primary_domain().to_string();
        let message_id = message_id_for(&event.event_id, &domain);
        let email = OutgoingEmail {
            from: format!("{}@{}", mailbox, domain),
            recipients: to.clone(),
            to,
            subject,
            text: body,
            references: vec![message_id.clone()],
            message_id,
            ..OutgoingEmail::default()
        };

        let result = match email.to_message() {
            Ok(message) => {
                let data = sign_or_passthrough(self.dkim.as_ref(), &domain, message);
                let report = self
                    .deliver(&email.from, &email.recipients, &data, room_settings.relay())
                    .await;
                let relation = turn_relation(
                    room_settings.display().threads,
                    &event.event_id,
                    &event.event_id,
                );
                self.finish_turn(room, &event.event_id, relation, &email, &report)
                    .await
            }
            Err(e) => {
                self.notice(room, MessageContent::notice(format!("Cannot send: {}", e)))
                    .await;
                Ok(false)
            }
        };

        let key = match &result {
            Ok(true) => DONE_MARKER,
            _ => FAILED_MARKER,
        };
        self.mark_finished(room, &event.event_id, marker, key).await;
        result.map(|_| ())
    }

    /// Post the outcome into the thread and remember the sent turn.
    ///
    /// Returns true when every recipient was sent to or queued.
    async fn finish_turn(
        &self,
        room: &str,
        root: &str,
        relation: Relation,
        email: &OutgoingEmail,
        report: &DeliveryReport,
    ) -> Result<bool> {
        let notice = MessageContent::notice(report.summary()).with_relation(Some(relation));
        if !report.accepted() {
            self.notice(room, notice).await;
            return Ok(false);
        }

        let event = self
            .chat
            .send(room, &notice.with_fields(email.fields()))
            .await?;
        self.reconciler
            .record(room, &email.message_id, root, &email.references)
            .await?;
        self.reconciler.set_last(room, root, &event).await?;

        info!(
            room = %room,
            message_id = %email.message_id,
            sent = report.sent.len(),
            queued = report.queued.len(),
            failed = report.failed.len(),
            "Outbound email processed"
        );
        Ok(report.failed.is_empty())
    }

    /// Relay an email submitted by an authenticated SMTP client for `room`.
    ///
    /// The envelope sender must be one of the room's addresses. The email
    /// also starts a thread in the room.
    pub async fn submit(&self, room: &str, envelope: &Envelope, raw: &[u8]) -> Result<()> {
        let room_settings = settings::load_room(self.store.as_ref(), room).await;
        let sender = envelope
            .from
            .as_ref()
            .ok_or_else(|| Error::Validation("Missing sender".to_string()))?;
        if !self.is_room_address(&room_settings, sender) {
            return Err(Error::PermissionDenied(format!(
                "{} does not belong to this mailbox",
                sender
            )));
        }

        let from = sender.to_string().to_lowercase();
        let recipients: Vec<String> = envelope.to.iter().map(|a| a.to_string()).collect();
        let data = sign_or_passthrough(self.dkim.as_ref(), &sender.domain.to_lowercase(), raw.to_vec());
        let report = self
            .deliver(&from, &recipients, &data, room_settings.relay())
            .await;

        let _room_lock = self.locks.lock(room).await;
        let display = room_settings.display();
        match Email::parse(raw, Some(&from), &from) {
            Ok(email) => {
                let event = self.chat.send(room, &email.content(&display, None)).await?;
                self.reconciler
                    .record(room, &email.message_id, &event, &email.references)
                    .await?;
                self.reconciler.set_last(room, &event, &event).await?;
                if !report.failed.is_empty() {
                    let relation = turn_relation(display.threads, &event, &event);
                    self.notice(
                        room,
                        MessageContent::notice(report.summary()).with_relation(Some(relation)),
                    )
                    .await;
                }
            }
            Err(e) => warn!(room = %room, "Submitted email could not be parsed for the room: {}", e),
        }

        if report.accepted() {
            info!(room = %room, from = %from, "Submitted email relayed");
            Ok(())
        } else {
            Err(Error::Delivery(report.summary()))
        }
    }

    /// Whether `address` is the room's mailbox or an alias on a local domain
    fn is_room_address(&self, room_settings: &RoomSettings, address: &EmailAddress) -> bool {
        if !room_settings.active() || !self.is_local_domain(&address.domain) {
            return false;
        }
        let local = normalize_mailbox(&address.local);
        let local = local.split('+').next().unwrap_or_default().to_string();
        room_settings.mailbox().as_deref() == Some(local.as_str())
            || room_settings.aliases().contains(&local)
    }
}
