//! Matrix client-server API over HTTP
//!
//! Only the handful of v3 endpoints the bridge needs. Custom email header
//! fields ride along in the event content under the `cc.postroom.` namespace.

use super::{
    Attachment, ChatClient, ChatEvent, Dispatcher, Membership, MembershipEvent, MessageContent,
    MessageKind, Relation,
};
use async_trait::async_trait;
use postroom_common::config::MatrixConfig;
use postroom_common::types::{EventId, RoomId, UserId};
use postroom_common::{Error, Result};
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Namespace for persisted custom fields
pub const FIELD_NAMESPACE: &str = "cc.postroom.";

const CLIENT_PATH: [&str; 3] = ["_matrix", "client", "v3"];

#[derive(Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct WhoAmI {
    user_id: String,
}

#[derive(Deserialize)]
struct JoinedRooms {
    joined_rooms: Vec<String>,
}

#[derive(Deserialize)]
struct JoinedMembers {
    joined: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct ContentUri {
    content_uri: String,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
    sender: String,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    content: Value,
}

/// Events collected from one sync response
#[derive(Debug, Default)]
pub struct SyncBatch {
    pub next_batch: String,
    pub messages: Vec<ChatEvent>,
    pub memberships: Vec<MembershipEvent>,
}

/// Matrix homeserver client
pub struct MatrixClient {
    client: Client,
    homeserver: Url,
    access_token: String,
    user_id: UserId,
    sync_timeout: Duration,
}

impl MatrixClient {
    /// Connect to the homeserver and look up the bot's own user id
    pub async fn connect(config: &MatrixConfig) -> Result<Self> {
        let homeserver = Url::parse(&config.homeserver)
            .map_err(|e| Error::Config(format!("Invalid homeserver URL: {}", e)))?;
        let sync_timeout = Duration::from_secs(config.sync_timeout_secs);

        let client = Client::builder()
            .timeout(sync_timeout + Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Chat(format!("Failed to create HTTP client: {}", e)))?;

        let mut matrix = Self {
            client,
            homeserver,
            access_token: config.access_token.clone(),
            user_id: String::new(),
            sync_timeout,
        };

        let whoami: WhoAmI = matrix
            .execute(matrix.build_request(Method::GET, &["account", "whoami"]))
            .await?;
        info!(user = %whoami.user_id, "Connected to homeserver");
        matrix.user_id = whoami.user_id;

        Ok(matrix)
    }

    fn url(&self, base: &[&str], segments: &[&str]) -> Url {
        let mut url = self.homeserver.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(base);
            path.extend(segments);
        }
        url
    }

    /// Build an authenticated request against the client API
    fn build_request(&self, method: Method, segments: &[&str]) -> reqwest::RequestBuilder {
        let url = self.url(&CLIENT_PATH, segments);
        self.client
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Chat(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                403 => Error::PermissionDenied(body),
                404 => Error::NotFound(body),
                _ => Error::Chat(format!("Homeserver returned {}: {}", status, body)),
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::Chat(format!("Invalid homeserver response: {}", e)))
    }

    async fn send_event(&self, room: &str, event_type: &str, content: Value) -> Result<EventId> {
        let txn = uuid::Uuid::new_v4().to_string();
        let response: EventIdResponse = self
            .execute(
                self.build_request(Method::PUT, &["rooms", room, "send", event_type, &txn])
                    .json(&content),
            )
            .await?;
        debug!(room = %room, event = %response.event_id, "Sent {}", event_type);
        Ok(response.event_id)
    }

    async fn redact(&self, room: &str, event: &str) -> Result<()> {
        let txn = uuid::Uuid::new_v4().to_string();
        let _: EventIdResponse = self
            .execute(
                self.build_request(Method::PUT, &["rooms", room, "redact", event, &txn])
                    .json(&json!({})),
            )
            .await?;
        Ok(())
    }

    async fn upload(&self, attachment: &Attachment) -> Result<String> {
        let url = self.url(&["_matrix", "media", "v3"], &["upload"]);
        let request = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .query(&[("filename", attachment.name.as_str())])
            .header(reqwest::header::CONTENT_TYPE, attachment.mime_type.as_str())
            .body(attachment.data.clone());

        let response: ContentUri = self.execute(request).await?;
        Ok(response.content_uri)
    }

    /// Run one sync request
    pub async fn sync(&self, since: Option<&str>) -> Result<SyncBatch> {
        let timeout_ms = self.sync_timeout.as_millis().to_string();
        let mut request = self
            .build_request(Method::GET, &["sync"])
            .query(&[("timeout", timeout_ms.as_str())]);
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response: Value = self.execute(request).await?;
        Ok(parse_sync(&response, &self.user_id))
    }

    /// Sync forever, feeding events into the dispatcher.
    ///
    /// The first response only establishes the position; backlog messages
    /// from before startup are not replayed, pending invites are.
    pub async fn sync_loop(&self, dispatcher: Dispatcher) {
        let mut since: Option<String> = None;

        loop {
            match self.sync(since.as_deref()).await {
                Ok(batch) => {
                    if since.is_some() {
                        for message in batch.messages {
                            dispatcher.push_message(message).await;
                        }
                    }
                    for membership in batch.memberships {
                        if since.is_some() || membership.membership == Membership::Invite {
                            dispatcher.push_membership(membership).await;
                        }
                    }
                    since = Some(batch.next_batch);
                }
                Err(e) => {
                    warn!("Sync failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}

#[async_trait]
impl ChatClient for MatrixClient {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn send(&self, room: &str, content: &MessageContent) -> Result<EventId> {
        self.send_event(room, "m.room.message", content_to_json(content))
            .await
    }

    async fn send_reaction(&self, room: &str, event: &str, key: &str) -> Result<EventId> {
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": event,
                "key": key,
            }
        });
        self.send_event(room, "m.reaction", content).await
    }

    async fn replace_reaction(
        &self,
        room: &str,
        event: &str,
        old_reaction: &str,
        key: &str,
    ) -> Result<EventId> {
        if let Err(e) = self.redact(room, old_reaction).await {
            warn!(room = %room, event = %old_reaction, "Failed to redact reaction: {}", e);
        }
        self.send_reaction(room, event, key).await
    }

    async fn send_file(
        &self,
        room: &str,
        attachment: &Attachment,
        relation: Option<&Relation>,
    ) -> Result<EventId> {
        let uri = self.upload(attachment).await?;
        let msgtype = match attachment.mime_type.split('/').next() {
            Some("image") => "m.image",
            Some("audio") => "m.audio",
            Some("video") => "m.video",
            _ => "m.file",
        };

        let mut content = json!({
            "msgtype": msgtype,
            "body": attachment.name,
            "url": uri,
            "info": {
                "mimetype": attachment.mime_type,
                "size": attachment.data.len(),
            },
        });
        if let (Some(relation), Some(object)) = (relation, content.as_object_mut()) {
            object.insert("m.relates_to".to_string(), relation_to_json(relation));
        }

        self.send_event(room, "m.room.message", content).await
    }

    async fn get_event(&self, room: &str, event: &str) -> Result<ChatEvent> {
        let raw: RawEvent = self
            .execute(self.build_request(Method::GET, &["rooms", room, "event", event]))
            .await?;

        if raw.kind == "m.room.encrypted" {
            return Err(Error::Chat(format!("Event {} is encrypted", event)));
        }
        if raw.kind != "m.room.message" {
            return Err(Error::NotFound(format!("Event {} is not a message", event)));
        }

        Ok(ChatEvent {
            event_id: raw.event_id.unwrap_or_else(|| event.to_string()),
            room_id: room.to_string(),
            sender: raw.sender,
            content: content_from_json(&raw.content),
        })
    }

    async fn joined_rooms(&self) -> Result<Vec<RoomId>> {
        let response: JoinedRooms = self
            .execute(self.build_request(Method::GET, &["joined_rooms"]))
            .await?;
        Ok(response.joined_rooms)
    }

    async fn joined_members(&self, room: &str) -> Result<Vec<UserId>> {
        let response: JoinedMembers = self
            .execute(self.build_request(Method::GET, &["rooms", room, "joined_members"]))
            .await?;
        let mut members: Vec<UserId> = response.joined.into_keys().collect();
        members.sort();
        Ok(members)
    }

    async fn join(&self, room: &str) -> Result<()> {
        let _: Value = self
            .execute(self.build_request(Method::POST, &["join", room]).json(&json!({})))
            .await?;
        info!(room = %room, "Joined room");
        Ok(())
    }

    async fn leave(&self, room: &str) -> Result<()> {
        let _: Value = self
            .execute(
                self.build_request(Method::POST, &["rooms", room, "leave"])
                    .json(&json!({})),
            )
            .await?;
        info!(room = %room, "Left room");
        Ok(())
    }
}

fn relation_to_json(relation: &Relation) -> Value {
    match relation {
        Relation::Thread { root, reply_to } => json!({
            "rel_type": "m.thread",
            "event_id": root,
            "is_falling_back": reply_to.is_none(),
            "m.in_reply_to": { "event_id": reply_to.as_deref().unwrap_or(root) },
        }),
        Relation::Reply { event } => json!({
            "m.in_reply_to": { "event_id": event },
        }),
    }
}

fn relation_from_json(value: &Value) -> Option<Relation> {
    let in_reply_to = value
        .pointer("/m.in_reply_to/event_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    if value.get("rel_type").and_then(Value::as_str) == Some("m.thread") {
        let root = value.get("event_id").and_then(Value::as_str)?.to_string();
        let falling_back = value
            .get("is_falling_back")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let reply_to = if falling_back { None } else { in_reply_to };
        return Some(Relation::Thread { root, reply_to });
    }

    in_reply_to.map(|event| Relation::Reply { event })
}

/// Encode message content as event JSON
pub fn content_to_json(content: &MessageContent) -> Value {
    let mut object = Map::new();
    let msgtype = match content.kind {
        MessageKind::Text => "m.text",
        MessageKind::Notice => "m.notice",
        MessageKind::File => "m.file",
    };
    object.insert("msgtype".to_string(), json!(msgtype));
    object.insert("body".to_string(), json!(content.body));

    if let Some(html) = &content.formatted_body {
        object.insert("format".to_string(), json!("org.matrix.custom.html"));
        object.insert("formatted_body".to_string(), json!(html));
    }
    if let Some(relation) = &content.relation {
        object.insert("m.relates_to".to_string(), relation_to_json(relation));
    }
    for (name, value) in &content.fields {
        object.insert(format!("{}{}", FIELD_NAMESPACE, name), json!(value));
    }

    Value::Object(object)
}

/// Decode event JSON into message content
pub fn content_from_json(value: &Value) -> MessageContent {
    let kind = match value.get("msgtype").and_then(Value::as_str) {
        Some("m.notice") => MessageKind::Notice,
        Some("m.file") | Some("m.image") | Some("m.audio") | Some("m.video") => MessageKind::File,
        _ => MessageKind::Text,
    };

    let fields: BTreeMap<String, String> = value
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(key, value)| {
                    let name = key.strip_prefix(FIELD_NAMESPACE)?;
                    Some((name.to_string(), value.as_str()?.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageContent {
        kind,
        body: value
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        formatted_body: value
            .get("formatted_body")
            .and_then(Value::as_str)
            .map(str::to_string),
        relation: value.get("m.relates_to").and_then(relation_from_json),
        fields,
    }
}

fn parse_membership(value: &str) -> Option<Membership> {
    match value {
        "invite" => Some(Membership::Invite),
        "join" => Some(Membership::Join),
        "leave" | "ban" => Some(Membership::Leave),
        _ => None,
    }
}

fn member_event(room_id: &str, raw: &RawEvent) -> Option<MembershipEvent> {
    let membership = raw
        .content
        .get("membership")
        .and_then(Value::as_str)
        .and_then(parse_membership)?;
    Some(MembershipEvent {
        room_id: room_id.to_string(),
        user_id: raw.state_key.clone()?,
        sender: raw.sender.clone(),
        membership,
    })
}

fn parse_sync(response: &Value, own_user: &str) -> SyncBatch {
    let mut batch = SyncBatch {
        next_batch: response
            .get("next_batch")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        ..Default::default()
    };

    let events_at = |room: &Value, pointer: &str| -> Vec<RawEvent> {
        room.pointer(pointer)
            .and_then(Value::as_array)
            .map(|events| {
                events
                    .iter()
                    .filter_map(|e| serde_json::from_value(e.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    };

    if let Some(joined) = response.pointer("/rooms/join").and_then(Value::as_object) {
        for (room_id, room) in joined {
            for raw in events_at(room, "/timeline/events") {
                match raw.kind.as_str() {
                    "m.room.message" if raw.sender != own_user => {
                        if let Some(event_id) = raw.event_id.clone() {
                            batch.messages.push(ChatEvent {
                                event_id,
                                room_id: raw.room_id.clone().unwrap_or_else(|| room_id.clone()),
                                sender: raw.sender.clone(),
                                content: content_from_json(&raw.content),
                            });
                        }
                    }
                    "m.room.member" => {
                        if let Some(event) = member_event(room_id, &raw) {
                            batch.memberships.push(event);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(invited) = response.pointer("/rooms/invite").and_then(Value::as_object) {
        for (room_id, room) in invited {
            for raw in events_at(room, "/invite_state/events") {
                if raw.kind != "m.room.member" || raw.state_key.as_deref() != Some(own_user) {
                    continue;
                }
                if let Some(event) = member_event(room_id, &raw) {
                    batch.memberships.push(event);
                }
            }
        }
    }

    batch
}
