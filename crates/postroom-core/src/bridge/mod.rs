//! Bridge aggregate
//!
//! Owns the registry, abuse guard, thread reconciler and delivery queue and
//! wires them to the chat network and the SMTP listener. Handlers receive
//! the bridge by reference; there is no process-wide mutable state.

mod commands;
mod inbound;
mod outbound;

pub use outbound::DeliveryReport;

use crate::chat::{ChatClient, ChatEvent, ChatHandler, Membership, MembershipEvent, MessageContent};
use crate::delivery::Transport;
use crate::email::DkimSigner;
use crate::guard::{AbuseGuard, Dnsbl, GuardPolicy, SenderValidator};
use crate::locks::KeyedLocks;
use crate::queue::{DeliveryQueue, QueueReport};
use crate::registry::{MailboxBinding, Registry};
use crate::settings::{self, BotSettings, RoomSettings};
use crate::smtp::verify_password;
use crate::threads::Reconciler;
use async_trait::async_trait;
use postroom_common::config::{Config, MailConfig};
use postroom_common::types::{normalize_mailbox, wildcard_match, EmailAddress, RoomId};
use postroom_common::Result;
use postroom_storage::KvStore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reaction shown while a room operation holds the room lock
pub const PROCESSING_MARKER: &str = "⏳";
/// Reaction shown once the operation finished
pub const DONE_MARKER: &str = "✅";
/// Reaction shown when the operation failed
pub const FAILED_MARKER: &str = "❌";

/// Serializes mailbox claims against each other and against rebuilds
const REGISTRY_LOCK: &str = "registry";

/// Collaborators the bridge is built from
pub struct BridgeParts {
    pub store: Arc<dyn KvStore>,
    pub chat: Arc<dyn ChatClient>,
    pub transport: Arc<dyn Transport>,
    pub dnsbl: Option<Dnsbl>,
    pub validator: Option<SenderValidator>,
    pub dkim: Option<DkimSigner>,
}

/// The email to chat bridge
pub struct Bridge {
    mail: MailConfig,
    prefix: String,
    store: Arc<dyn KvStore>,
    chat: Arc<dyn ChatClient>,
    transport: Arc<dyn Transport>,
    locks: Arc<KeyedLocks>,
    registry: Registry,
    guard: AbuseGuard,
    reconciler: Reconciler,
    queue: DeliveryQueue,
    validator: Option<SenderValidator>,
    dkim: Option<DkimSigner>,
}

impl Bridge {
    pub fn new(config: &Config, parts: BridgeParts) -> Self {
        let locks = Arc::new(KeyedLocks::new());
        Self {
            mail: config.mail.clone(),
            prefix: config.matrix.prefix.clone(),
            guard: AbuseGuard::new(
                parts.store.clone(),
                locks.clone(),
                &config.mail.trusted_proxies,
                parts.dnsbl,
            ),
            reconciler: Reconciler::new(parts.store.clone()),
            queue: DeliveryQueue::new(parts.store.clone(), locks.clone(), parts.transport.clone()),
            registry: Registry::new(),
            store: parts.store,
            chat: parts.chat,
            transport: parts.transport,
            locks,
            validator: parts.validator,
            dkim: parts.dkim,
        }
    }

    pub fn guard(&self) -> &AbuseGuard {
        &self.guard
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn domains(&self) -> &[String] {
        &self.mail.domains
    }

    /// Load bot settings and build the registry from joined rooms
    pub async fn start(&self) -> Result<()> {
        let bot = settings::load_bot(self.store.as_ref()).await;
        self.apply_bot_settings(&bot).await;
        self.rebuild_registry().await
    }

    async fn apply_bot_settings(&self, bot: &BotSettings) {
        self.guard
            .set_policy(GuardPolicy {
                greylist_minutes: bot.greylist_minutes(),
                banlist: bot.banlist_enabled(),
                banlist_auto: bot.banlist_auto(),
            })
            .await;
        self.registry.set_catch_all(bot.catch_all()).await;
    }

    /// Rebuild the registry from the settings of every joined room
    pub async fn rebuild_registry(&self) -> Result<()> {
        let _guard = self.locks.lock(REGISTRY_LOCK).await;
        self.rebuild_registry_locked().await
    }

    /// Register the room's binding, then persist its settings.
    ///
    /// The registry claim happens first, so of two rooms racing for a name
    /// only one gets it. A failed save restores the previous binding.
    pub(crate) async fn bind_room(&self, room: &str, room_settings: RoomSettings) -> Result<()> {
        let _guard = self.locks.lock(REGISTRY_LOCK).await;
        let previous = self.registry.binding_of(room).await;

        if let Some(binding) = binding_from_settings(room, &room_settings) {
            self.registry.register(binding).await?;
        }

        if let Err(e) = settings::save_room(self.store.as_ref(), room, room_settings).await {
            match previous {
                Some(previous) => {
                    if let Err(restore) = self.registry.register(previous).await {
                        warn!(room = %room, "Failed to restore binding: {}", restore);
                    }
                }
                None => self.registry.remove_room(room).await,
            }
            return Err(e);
        }

        // Admin rooms follow owners
        if let Err(e) = self.rebuild_registry_locked().await {
            warn!(room = %room, "Registry refresh after claim failed: {}", e);
        }
        Ok(())
    }

    /// Persist the stopped settings and free the mailbox with its aliases
    pub(crate) async fn unbind_room(
        &self,
        room: &str,
        mailbox: &str,
        room_settings: RoomSettings,
    ) -> Result<()> {
        let _guard = self.locks.lock(REGISTRY_LOCK).await;
        settings::save_room(self.store.as_ref(), room, room_settings).await?;
        if !self.registry.deactivate(mailbox).await {
            debug!(room = %room, mailbox = %mailbox, "Mailbox was not active");
        }
        Ok(())
    }

    async fn rebuild_registry_locked(&self) -> Result<()> {
        let rooms = self.chat.joined_rooms().await?;
        let bot = settings::load_bot(self.store.as_ref()).await;

        let mut bindings = Vec::new();
        let mut admin_rooms: Vec<RoomId> = bot.admin_room().map(str::to_string).into_iter().collect();
        for room in rooms {
            let room_settings = settings::load_room(self.store.as_ref(), &room).await;
            let Some(binding) = binding_from_settings(&room, &room_settings) else {
                continue;
            };
            if binding.active && self.is_admin(&binding.owner) && !admin_rooms.contains(&room) {
                admin_rooms.push(room.clone());
            }
            bindings.push(binding);
        }

        self.registry.rebuild(bindings, admin_rooms, bot.catch_all()).await;
        Ok(())
    }

    /// Whether a chat user matches the admin patterns
    pub fn is_admin(&self, user: &str) -> bool {
        !user.is_empty() && self.mail.admins.iter().any(|p| wildcard_match(p, user))
    }

    /// Whether a chat user may invite the bot
    pub fn is_allowed(&self, user: &str) -> bool {
        self.mail.users.is_empty()
            || self.is_admin(user)
            || self.mail.users.iter().any(|p| wildcard_match(p, user))
    }

    fn is_local_domain(&self, domain: &str) -> bool {
        self.mail.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    /// Room for a recipient address, if it is ours and bound
    pub async fn resolve(&self, address: &str) -> Option<RoomId> {
        let address = EmailAddress::parse(address.trim())?;
        if !self.is_local_domain(&address.domain) {
            return None;
        }
        let local = normalize_mailbox(&address.local);
        // Sub-addressing: sales+quotes@ goes to sales@
        let mailbox = local.split('+').next().unwrap_or(&local);
        self.registry.resolve(mailbox).await
    }

    /// Room a submission login may send from.
    ///
    /// The address must be on a local domain, bound to a room that allows
    /// sending, and the password must match the room's stored hash.
    pub async fn allow_auth(&self, address: &str, password: &str) -> Option<RoomId> {
        let parsed = EmailAddress::parse(address.trim())?;
        if !self.is_local_domain(&parsed.domain) {
            debug!(mailbox = %address, "Login for a foreign domain");
            return None;
        }
        let local = normalize_mailbox(&parsed.local);
        let room = self.registry.resolve(&local).await?;
        // No logging in through the catch-all
        let binding = self.registry.binding_of(&room).await?;
        if binding.name != local && !binding.aliases.contains(&local) {
            return None;
        }
        let room_settings = settings::load_room(self.store.as_ref(), &room).await;
        if room_settings.nosend() {
            debug!(mailbox = %address, room = %room, "Login to a room with sending disabled");
            return None;
        }
        let hash = room_settings.password_hash()?;
        match verify_password(password, hash) {
            Ok(true) => Some(room),
            Ok(false) => None,
            Err(e) => {
                warn!(room = %room, "Password verification error: {}", e);
                None
            }
        }
    }

    /// PEM of the DKIM signing key, when one is configured
    pub fn dkim_private_key(&self) -> Option<String> {
        self.dkim.as_ref().map(|k| k.private_key_pem().to_string())
    }

    /// One queue sweep with the batch size and retry budget from bot settings
    pub async fn process_queue(&self) -> Result<QueueReport> {
        let bot = settings::load_bot(self.store.as_ref()).await;
        self.queue
            .process(bot.queue_batch(), bot.queue_retries())
            .await
    }

    /// Post a notice to every admin room
    pub async fn notify_admins(&self, text: &str) {
        for room in self.registry.admin_rooms().await {
            if let Err(e) = self.chat.send(&room, &MessageContent::notice(text)).await {
                warn!(room = %room, "Failed to notify admin room: {}", e);
            }
        }
    }

    /// Send a notice, logging instead of failing
    async fn notice(&self, room: &str, content: MessageContent) -> Option<String> {
        match self.chat.send(room, &content).await {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(room = %room, "Failed to send notice: {}", e);
                None
            }
        }
    }

    /// Put the processing marker on an event
    async fn mark_processing(&self, room: &str, event: &str) -> Option<String> {
        match self.chat.send_reaction(room, event, PROCESSING_MARKER).await {
            Ok(reaction) => Some(reaction),
            Err(e) => {
                debug!(room = %room, event = %event, "Failed to add processing marker: {}", e);
                None
            }
        }
    }

    /// Swap the processing marker for `key`
    async fn mark_finished(&self, room: &str, event: &str, marker: Option<String>, key: &str) {
        let result = match marker {
            Some(reaction) => self.chat.replace_reaction(room, event, &reaction, key).await,
            None => self.chat.send_reaction(room, event, key).await,
        };
        if let Err(e) = result {
            debug!(room = %room, event = %event, "Failed to update marker: {}", e);
        }
    }

    async fn handle_invite(&self, event: &MembershipEvent) {
        if !self.is_allowed(&event.sender) {
            info!(room = %event.room_id, inviter = %event.sender, "Ignoring invite from a user that is not allowed");
            return;
        }
        match self.chat.join(&event.room_id).await {
            Ok(()) => {
                info!(room = %event.room_id, inviter = %event.sender, "Joined room");
                let greeting = format!(
                    "Hello! Claim a mailbox with `{} mailbox NAME`, see `{} help` for everything else.",
                    self.prefix, self.prefix
                );
                self.notice(&event.room_id, MessageContent::notice(greeting)).await;
            }
            Err(e) => warn!(room = %event.room_id, "Failed to join room: {}", e),
        }
    }

    async fn handle_departure(&self, event: &MembershipEvent) {
        if event.user_id == self.chat.user_id() {
            self.registry.remove_room(&event.room_id).await;
            return;
        }

        let members = match self.chat.joined_members(&event.room_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(room = %event.room_id, "Failed to list members: {}", e);
                return;
            }
        };
        if members.iter().any(|m| m != self.chat.user_id()) {
            return;
        }

        info!(room = %event.room_id, "Last member left, leaving room");
        if let Err(e) = self.chat.leave(&event.room_id).await {
            warn!(room = %event.room_id, "Failed to leave room: {}", e);
        }
        self.registry.remove_room(&event.room_id).await;
    }
}

/// Registry binding described by a room's settings
fn binding_from_settings(room: &str, settings: &RoomSettings) -> Option<MailboxBinding> {
    let name = settings.mailbox()?;
    Some(MailboxBinding {
        name,
        room_id: room.to_string(),
        active: settings.active(),
        aliases: settings.aliases(),
        owner: settings.owner().to_string(),
    })
}

#[async_trait]
impl ChatHandler for Bridge {
    async fn on_message(&self, event: ChatEvent) {
        if event.sender == self.chat.user_id() {
            return;
        }

        let body = event.content.body.trim();
        if body == self.prefix || body.starts_with(&format!("{} ", self.prefix))
            || body.starts_with(&format!("{}\n", self.prefix))
        {
            self.handle_command(&event).await;
            return;
        }

        if event.content.relation.is_some() {
            if let Err(e) = self.send_reply(&event).await {
                error!(room = %event.room_id, event = %event.event_id, "Failed to send reply: {}", e);
            }
        }
    }

    async fn on_membership(&self, event: MembershipEvent) {
        match event.membership {
            Membership::Invite if event.user_id == self.chat.user_id() => {
                self.handle_invite(&event).await
            }
            Membership::Leave => self.handle_departure(&event).await,
            _ => {}
        }
    }
}
