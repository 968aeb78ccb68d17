//! Outbound email composition

use super::{
    cached_regex, FIELD_CC, FIELD_FROM, FIELD_IN_REPLY_TO, FIELD_MESSAGE_ID, FIELD_REFERENCES,
    FIELD_SUBJECT, FIELD_TO,
};
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::Message;
use postroom_common::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const SUBJECT_FROM_BODY_LIMIT: usize = 78;

/// Email composed from a room message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    /// Message-Id without angle brackets
    pub message_id: String,
    pub in_reply_to: String,
    pub references: Vec<String>,
    /// Envelope recipients
    pub recipients: Vec<String>,
}

impl OutgoingEmail {
    /// Build RFC 5322 bytes
    pub fn to_message(&self) -> Result<Vec<u8>> {
        let mut builder = Message::builder()
            .from(mailbox(&self.from)?)
            .subject(self.subject.as_str())
            .message_id(Some(format!("<{}>", self.message_id)))
            .date_now();

        for to in &self.to {
            builder = builder.to(mailbox(to)?);
        }
        for cc in &self.cc {
            builder = builder.cc(mailbox(cc)?);
        }
        if !self.in_reply_to.is_empty() {
            builder = builder.in_reply_to(format!("<{}>", self.in_reply_to));
        }
        if !self.references.is_empty() {
            let references: Vec<String> =
                self.references.iter().map(|id| format!("<{}>", id)).collect();
            builder = builder.references(references.join(" "));
        }

        let message = match &self.html {
            Some(html) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(self.text.clone()))
                    .singlepart(SinglePart::html(html.clone())),
            ),
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(self.text.clone()),
        }
        .map_err(|e| Error::Validation(format!("Failed to build email: {}", e)))?;

        Ok(message.formatted())
    }

    /// Fields persisted on the notice that records this turn in the room
    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        let mut put = |name: &str, value: String| {
            if !value.is_empty() {
                fields.insert(name.to_string(), value);
            }
        };
        put(FIELD_FROM, self.from.clone());
        put(FIELD_TO, self.to.join(", "));
        put(FIELD_CC, self.cc.join(", "));
        put(FIELD_MESSAGE_ID, self.message_id.clone());
        put(FIELD_IN_REPLY_TO, self.in_reply_to.clone());
        put(FIELD_REFERENCES, self.references.join(" "));
        put(FIELD_SUBJECT, self.subject.clone());
        fields
    }
}

fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid address {}: {}", address, e)))
}

/// Subject of a reply: `Re: ` + the previous subject, or the first line of the body
pub fn reply_subject(previous: &str, body: &str) -> String {
    let previous = previous.trim();
    if !previous.is_empty() {
        if previous.to_lowercase().starts_with("re:") {
            return previous.to_string();
        }
        return format!("Re: {}", previous);
    }

    let line = body
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    line.chars().take(SUBJECT_FROM_BODY_LIMIT).collect()
}

/// Remove the quoted fallback a chat client adds to replies
///
/// Plain bodies lose their leading `> ` lines, HTML bodies their `<mx-reply>` block.
pub fn strip_quoted_reply(body: &str) -> String {
    static MX_REPLY: OnceLock<Option<Regex>> = OnceLock::new();

    let mut body = body.to_string();
    if let Some(re) = cached_regex(&MX_REPLY, r"(?s)<mx-reply>.*?</mx-reply>") {
        body = re.replace_all(&body, "").into_owned();
    }

    let mut lines = body.lines().peekable();
    let mut quoted = false;
    while lines.peek().is_some_and(|l| l.starts_with('>')) {
        lines.next();
        quoted = true;
    }
    if quoted {
        while lines.peek().is_some_and(|l| l.trim().is_empty()) {
            lines.next();
        }
    }

    lines.collect::<Vec<_>>().join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn outgoing() -> OutgoingEmail {
        OutgoingEmail {
            from: "sales@example.com".to_string(),
            to: vec!["alice@example.org".to_string()],
            cc: vec!["carol@example.net".to_string()],
            subject: "Re: Quote request".to_string(),
            text: "Here is the quote.".to_string(),
            html: None,
            message_id: "evt1@example.com".to_string(),
            in_reply_to: "m2@example.org".to_string(),
            references: vec!["m2@example.org".to_string(), "evt1@example.com".to_string()],
            recipients: vec![
                "alice@example.org".to_string(),
                "carol@example.net".to_string(),
            ],
        }
    }

    #[test]
    fn test_to_message_headers() {
        let raw = String::from_utf8(outgoing().to_message().unwrap()).unwrap();
        assert!(raw.contains("From: sales@example.com"));
        assert!(raw.contains("To: alice@example.org"));
        assert!(raw.contains("Cc: carol@example.net"));
        assert!(raw.contains("Message-ID: <evt1@example.com>"));
        assert!(raw.contains("In-Reply-To: <m2@example.org>"));
        assert!(raw.contains("References: <m2@example.org> <evt1@example.com>"));
        assert!(raw.contains("Here is the quote."));
    }

    #[test]
    fn test_to_message_rejects_bad_address() {
        let mut email = outgoing();
        email.to = vec!["not an address".to_string()];
        assert!(email.to_message().is_err());
    }

    #[test]
    fn test_fields() {
        let fields = outgoing().fields();
        assert_eq!(fields.get(FIELD_FROM).unwrap(), "sales@example.com");
        assert_eq!(
            fields.get(FIELD_REFERENCES).unwrap(),
            "m2@example.org evt1@example.com"
        );
    }

    #[test]
    fn test_reply_subject() {
        assert_eq!(reply_subject("Quote", ""), "Re: Quote");
        assert_eq!(reply_subject("RE: Quote", ""), "RE: Quote");
        assert_eq!(reply_subject("", "\n  First line\nsecond"), "First line");
    }

    #[test]
    fn test_strip_quoted_reply() {
        let body = "> <@alice:example.org> original\n> more\n\nThanks!";
        assert_eq!(strip_quoted_reply(body), "Thanks!");

        let html = "<mx-reply><blockquote>quoted</blockquote></mx-reply><p>Thanks!</p>";
        assert_eq!(strip_quoted_reply(html), "<p>Thanks!</p>");

        assert_eq!(strip_quoted_reply("no quote\n> inline"), "no quote\n> inline");
    }
}
