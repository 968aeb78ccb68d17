//! Email decomposition and composition
//!
//! Inbound mail is parsed into [`Email`] and rendered into room content.
//! The header fields persisted on the published event are the only record
//! later replies have of a turn, so their names are fixed here.

pub mod compose;
pub mod dkim;

pub use compose::{reply_subject, strip_quoted_reply, OutgoingEmail};
pub use dkim::{sign_or_passthrough, DkimResult, DkimSigner, DkimVerifier};

use crate::chat::{Attachment, MessageContent, MessageKind, Relation};
use crate::settings::DisplayOptions;
use mail_parser::{Address, HeaderValue, MessageParser, MessagePart, MimeHeaders};
use postroom_common::types::{bare_address, parse_address_list};
use postroom_common::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const FIELD_FROM: &str = "from";
pub const FIELD_TO: &str = "to";
pub const FIELD_CC: &str = "cc";
pub const FIELD_RCPT_TO: &str = "rcpt_to";
pub const FIELD_MESSAGE_ID: &str = "message_id";
pub const FIELD_IN_REPLY_TO: &str = "in_reply_to";
pub const FIELD_REFERENCES: &str = "references";
pub const FIELD_SUBJECT: &str = "subject";
pub const FIELD_FORWARDED_FROM: &str = "forwarded_from";

/// Split raw message bytes into unfolded headers (lowercase names) and body
pub(crate) fn split_headers(raw: &[u8]) -> Option<(Vec<(String, String)>, String)> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .or_else(|| text.split_once("\n\n"))?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    Some((headers, body.to_string()))
}

/// Strip angle brackets and whitespace from a message id
pub fn clean_message_id(id: &str) -> String {
    id.trim().trim_start_matches('<').trim_end_matches('>').trim().to_string()
}

/// Split a References-style header into ids
pub fn split_message_ids(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(clean_message_id)
        .filter(|id| !id.is_empty())
        .collect()
}

fn addresses(address: Option<&Address>) -> Vec<String> {
    let Some(address) = address else {
        return Vec::new();
    };
    let mut result: Vec<String> = Vec::new();
    for addr in address.iter() {
        if let Some(bare) = addr.address().and_then(bare_address) {
            if !result.contains(&bare) {
                result.push(bare);
            }
        }
    }
    result
}

fn header_ids(value: &HeaderValue) -> Vec<String> {
    match value {
        HeaderValue::Text(text) => split_message_ids(text),
        HeaderValue::TextList(list) => list.iter().flat_map(|t| split_message_ids(t)).collect(),
        _ => Vec::new(),
    }
}

/// Compile a constant pattern once
pub(crate) fn cached_regex(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &str,
) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn is_text_html(part: &MessagePart) -> bool {
    part.content_type().is_some_and(|ct| {
        ct.ctype().eq_ignore_ascii_case("text")
            && ct.subtype().is_some_and(|sub| sub.eq_ignore_ascii_case("html"))
    })
}

fn html_to_text(html: &str) -> String {
    static BREAKS: OnceLock<Option<Regex>> = OnceLock::new();
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();

    let mut text = html.to_string();
    if let Some(re) = cached_regex(&BREAKS, r"(?i)<br\s*/?>|</p>|</div>|</li>|</tr>") {
        text = re.replace_all(&text, "\n").into_owned();
    }
    if let Some(re) = cached_regex(&TAGS, r"<[^>]*>") {
        text = re.replace_all(&text, "").into_owned();
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Parsed inbound email
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Email {
    /// Message-Id without angle brackets
    pub message_id: String,
    pub in_reply_to: String,
    pub references: Vec<String>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    /// Envelope recipient that routed the email to the room
    pub rcpt_to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Addresses this email was forwarded on behalf of
    pub forwarded_from: Vec<String>,
}

impl Email {
    /// Parse raw MIME for delivery to `rcpt_to`.
    ///
    /// A missing Message-Id is synthesized on the recipient's domain.
    pub fn parse(raw: &[u8], envelope_from: Option<&str>, rcpt_to: &str) -> Result<Self> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Validation("Failed to parse message".to_string()))?;

        let mut from = addresses(parsed.from());
        if from.is_empty() {
            from.extend(envelope_from.and_then(bare_address));
        }

        let message_id = match parsed.message_id().map(clean_message_id) {
            Some(id) if !id.is_empty() => id,
            _ => {
                let domain = rcpt_to.rsplit_once('@').map(|(_, d)| d).unwrap_or("localhost");
                format!("{}@{}", uuid::Uuid::new_v4(), domain)
            }
        };

        let in_reply_to = header_ids(parsed.in_reply_to())
            .into_iter()
            .next()
            .unwrap_or_default();
        let references = header_ids(parsed.references());

        // mail-parser renders plain bodies as HTML too; keep only real text/html parts
        let html = parsed
            .html_part(0)
            .filter(|part| is_text_html(part))
            .and_then(|part| part.text_contents())
            .map(str::to_string);
        let text = match parsed.body_text(0) {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ => html.as_deref().map(html_to_text).unwrap_or_default(),
        };

        let attachments = parsed
            .attachments()
            .map(|part| {
                let mime_type = part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                Attachment {
                    name: part.attachment_name().unwrap_or("attachment").to_string(),
                    mime_type,
                    data: part.contents().to_vec(),
                }
            })
            .collect();

        let mut forwarded_from = Vec::new();
        if let Some((headers, _)) = split_headers(raw) {
            for (name, value) in &headers {
                if name == "x-forwarded-for" || name == "resent-from" {
                    for addr in value.split_whitespace().flat_map(parse_address_list) {
                        if !forwarded_from.contains(&addr) {
                            forwarded_from.push(addr);
                        }
                    }
                }
            }
        }

        Ok(Self {
            message_id,
            in_reply_to,
            references,
            from,
            to: addresses(parsed.to()),
            cc: addresses(parsed.cc()),
            rcpt_to: rcpt_to.to_lowercase(),
            subject: parsed.subject().unwrap_or_default().trim().to_string(),
            text,
            html,
            attachments,
            forwarded_from,
        })
    }

    /// Ids that may name an earlier turn: In-Reply-To first, then References in order
    pub fn thread_candidates(&self) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        for id in std::iter::once(&self.in_reply_to).chain(self.references.iter()) {
            if !id.is_empty() && *id != self.message_id && !candidates.contains(id) {
                candidates.push(id.clone());
            }
        }
        candidates
    }

    /// Header fields persisted alongside the published event
    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        let mut put = |name: &str, value: String| {
            if !value.is_empty() {
                fields.insert(name.to_string(), value);
            }
        };
        put(FIELD_FROM, self.from.join(", "));
        put(FIELD_TO, self.to.join(", "));
        put(FIELD_CC, self.cc.join(", "));
        put(FIELD_RCPT_TO, self.rcpt_to.clone());
        put(FIELD_MESSAGE_ID, self.message_id.clone());
        put(FIELD_IN_REPLY_TO, self.in_reply_to.clone());
        put(FIELD_REFERENCES, self.references.join(" "));
        put(FIELD_SUBJECT, self.subject.clone());
        put(FIELD_FORWARDED_FROM, self.forwarded_from.join(", "));
        fields
    }

    /// Render into room content honoring the room's display options
    pub fn content(&self, options: &DisplayOptions, relation: Option<Relation>) -> MessageContent {
        let mut lines: Vec<(&str, String)> = Vec::new();
        if options.sender && !self.from.is_empty() {
            lines.push(("From", self.from.join(", ")));
        }
        if options.recipient && !self.to.is_empty() {
            lines.push(("To", self.to.join(", ")));
        }
        if options.cc && !self.cc.is_empty() {
            lines.push(("Cc", self.cc.join(", ")));
        }

        let mut body = String::new();
        let mut html = String::new();
        for (label, value) in &lines {
            body.push_str(&format!("{}: {}\n", label, value));
            html.push_str(&format!("<b>{}:</b> {}<br>", label, escape_html(value)));
        }
        if options.subject && !self.subject.is_empty() {
            body.push_str(&format!("\n{}\n", self.subject));
            html.push_str(&format!("<h3>{}</h3>", escape_html(&self.subject)));
        }
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(self.text.trim());

        let formatted_body = match (&self.html, options.html) {
            (Some(source), true) => {
                html.push_str(source);
                Some(html)
            }
            _ if !html.is_empty() => {
                html.push_str(&escape_html(self.text.trim()).replace('\n', "<br>"));
                Some(html)
            }
            _ => None,
        };

        MessageContent {
            kind: MessageKind::Text,
            body,
            formatted_body,
            relation,
            fields: self.fields(),
        }
    }
}
