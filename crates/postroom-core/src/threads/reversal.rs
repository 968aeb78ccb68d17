//! Address reversal for replies
//!
//! There is no live session to inspect when a room member replies, possibly
//! days later. The correspondents are rebuilt from the header fields stored
//! on the event of the previous turn and then swapped around.

use crate::email::{
    reply_subject, split_message_ids, OutgoingEmail, FIELD_CC, FIELD_FORWARDED_FROM, FIELD_FROM,
    FIELD_IN_REPLY_TO, FIELD_MESSAGE_ID, FIELD_RCPT_TO, FIELD_REFERENCES, FIELD_SUBJECT, FIELD_TO,
};
use postroom_common::types::{normalize_mailbox, parse_address_list};
use std::collections::BTreeMap;

/// Header fields of the previous turn of a thread
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviousTurn {
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub rcpt_to: String,
    pub message_id: String,
    pub in_reply_to: String,
    pub references: Vec<String>,
    pub subject: String,
    pub forwarded_from: Vec<String>,
}

impl PreviousTurn {
    /// Read the persisted fields of an event; `None` when it carries no email turn
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Option<Self> {
        let get = |name: &str| fields.get(name).map(String::as_str).unwrap_or_default();
        let turn = Self {
            from: parse_address_list(get(FIELD_FROM)),
            to: parse_address_list(get(FIELD_TO)),
            cc: parse_address_list(get(FIELD_CC)),
            rcpt_to: get(FIELD_RCPT_TO).trim().to_lowercase(),
            message_id: get(FIELD_MESSAGE_ID).trim().to_string(),
            in_reply_to: get(FIELD_IN_REPLY_TO).trim().to_string(),
            references: split_message_ids(get(FIELD_REFERENCES)),
            subject: get(FIELD_SUBJECT).to_string(),
            forwarded_from: parse_address_list(get(FIELD_FORWARDED_FROM)),
        };
        if turn.from.is_empty() && turn.to.is_empty() && turn.rcpt_to.is_empty() {
            return None;
        }
        Some(turn)
    }
}

/// Correspondents of the next turn, rebuilt from the previous one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correspondents {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub from_domain: String,
    pub message_id: String,
    pub in_reply_to: String,
    pub references: Vec<String>,
    /// Subject of the previous turn
    pub subject: String,
    pub recipients: Vec<String>,
}

/// Keep only characters that are safe in the local part of a Message-Id
fn sanitize_id(event_id: &str) -> String {
    event_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect()
}

/// Message-Id (without brackets) for an event, on `domain`
pub fn message_id_for(event_id: &str, domain: &str) -> String {
    format!("{}@{}", sanitize_id(event_id), domain)
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

impl Correspondents {
    /// Reverse the roles of `previous`.
    ///
    /// `names` are the room's mailbox and aliases, `domains` the local domains
    /// in configured order. The sending address is the first local address
    /// found in `rcpt_to`, `To`, `From` (in that order, per domain); with no
    /// match it falls back to the mailbox on the primary domain.
    pub fn reverse(
        previous: &PreviousTurn,
        names: &[String],
        domains: &[String],
        previous_event: &str,
        reply_event: &str,
    ) -> Self {
        let names: Vec<String> = names.iter().map(|n| normalize_mailbox(n)).collect();
        let is_ours = |addr: &str| {
            addr.rsplit_once('@').is_some_and(|(local, domain)| {
                names.iter().any(|n| *n == normalize_mailbox(local))
                    && domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
            })
        };

        let candidates: Vec<&String> = std::iter::once(&previous.rcpt_to)
            .chain(previous.to.iter())
            .chain(previous.from.iter())
            .collect();
        let mut sender = None;
        'domains: for domain in domains {
            for candidate in &candidates {
                let matches_domain = candidate
                    .rsplit_once('@')
                    .is_some_and(|(_, d)| d.eq_ignore_ascii_case(domain));
                if matches_domain && is_ours(candidate) {
                    sender = Some(candidate.to_string());
                    break 'domains;
                }
            }
        }
        let sender = sender.unwrap_or_else(|| {
            let mailbox = names.first().cloned().unwrap_or_default();
            let domain = domains.first().map(String::as_str).unwrap_or("localhost");
            format!("{}@{}", mailbox, domain)
        });
        let from_domain = sender
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_default();

        let original_from = previous.from.first().cloned().unwrap_or_default();
        let from = match previous.from.first() {
            Some(addr) if is_ours(addr) => addr.clone(),
            _ => sender.clone(),
        };

        let to_was_ours = previous.to.iter().any(|a| is_ours(a));
        let to: Vec<String> = if to_was_ours {
            previous.from.iter().filter(|a| !is_ours(a)).cloned().collect()
        } else {
            previous.to.clone()
        };

        let mut cc = Vec::new();
        let carried_to = previous.to.iter().filter(|_| to_was_ours);
        for addr in carried_to.chain(previous.cc.iter()) {
            if is_ours(addr) {
                push_unique(&mut cc, &original_from);
            } else {
                push_unique(&mut cc, addr);
            }
        }
        cc.retain(|a| !to.contains(a) && *a != from && !is_ours(a));

        let mut recipients = Vec::new();
        for addr in previous.from.iter().chain(&previous.to).chain(&previous.cc) {
            push_unique(&mut recipients, addr);
        }
        recipients.retain(|a| !previous.forwarded_from.contains(a) && *a != sender && *a != from);

        let message_id = message_id_for(reply_event, &from_domain);
        let in_reply_to = if previous.message_id.is_empty() {
            message_id_for(previous_event, &from_domain)
        } else {
            previous.message_id.clone()
        };
        let mut references = previous.references.clone();
        push_unique(&mut references, &in_reply_to);
        push_unique(&mut references, &message_id);

        Self {
            from,
            to,
            cc,
            from_domain,
            message_id,
            in_reply_to,
            references,
            subject: previous.subject.clone(),
            recipients,
        }
    }

    /// Turn into an email with the given body
    pub fn into_email(self, text: String, html: Option<String>) -> OutgoingEmail {
        OutgoingEmail {
            subject: reply_subject(&self.subject, &text),
            from: self.from,
            to: self.to,
            cc: self.cc,
            text,
            html,
            message_id: self.message_id,
            in_reply_to: self.in_reply_to,
            references: self.references,
            recipients: self.recipients,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn turn(from: &str, to: &str, cc: &str, rcpt_to: &str) -> PreviousTurn {
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_FROM.to_string(), from.to_string());
        fields.insert(FIELD_TO.to_string(), to.to_string());
        fields.insert(FIELD_CC.to_string(), cc.to_string());
        fields.insert(FIELD_RCPT_TO.to_string(), rcpt_to.to_string());
        fields.insert(FIELD_MESSAGE_ID.to_string(), "m1@x".to_string());
        fields.insert(FIELD_SUBJECT.to_string(), "Hello".to_string());
        PreviousTurn::from_fields(&fields).unwrap()
    }

    #[test]
    fn test_reply_swaps_from_and_to() {
        let previous = turn("a@x", "b@y", "", "b@y");
        let next = Correspondents::reverse(&previous, &strings(&["b"]), &strings(&["y"]), "$e1", "$e2");

        assert_eq!(next.from, "b@y");
        assert_eq!(next.to, strings(&["a@x"]));
        assert_eq!(next.recipients, strings(&["a@x"]));
        assert_eq!(next.from_domain, "y");
        assert_eq!(next.in_reply_to, "m1@x");
        assert_eq!(next.message_id, "e2@y");
        assert_eq!(next.references, strings(&["m1@x", "e2@y"]));
    }

    #[test]
    fn test_reversal_round_trip() {
        // Bridge owns b@y: a@x writes, the bridge answers
        let first = turn("a@x", "b@y", "", "b@y");
        let answer = Correspondents::reverse(&first, &strings(&["b"]), &strings(&["y"]), "$e1", "$e2");
        assert_eq!((answer.from.as_str(), answer.to.clone()), ("b@y", strings(&["a@x"])));

        // Bridge owns a@x and receives that answer: replying flips it back
        let second = turn(&answer.from, &answer.to.join(", "), "", "a@x");
        let back = Correspondents::reverse(&second, &strings(&["a"]), &strings(&["x"]), "$e3", "$e4");
        assert_eq!((back.from.as_str(), back.to.clone()), ("a@x", strings(&["b@y"])));
    }

    #[test]
    fn test_follow_up_to_own_turn_keeps_correspondent() {
        let own = turn("b@y", "a@x", "", "");
        let next = Correspondents::reverse(&own, &strings(&["b"]), &strings(&["y"]), "$e2", "$e3");
        assert_eq!(next.from, "b@y");
        assert_eq!(next.to, strings(&["a@x"]));
        assert_eq!(next.recipients, strings(&["a@x"]));
    }

    #[test]
    fn test_recipient_dedup() {
        let previous = turn("a@x", "b@y, c@y", "a@x", "b@y");
        let next = Correspondents::reverse(&previous, &strings(&["b"]), &strings(&["y"]), "$e1", "$e2");

        assert_eq!(next.recipients, strings(&["a@x", "c@y"]));
        assert_eq!(next.to, strings(&["a@x"]));
        assert_eq!(next.cc, strings(&["c@y"]));
    }

    #[test]
    fn test_own_address_in_cc_is_replaced() {
        let previous = turn("a@x", "d@z", "b@y", "b@y");
        let next = Correspondents::reverse(&previous, &strings(&["b"]), &strings(&["y"]), "$e1", "$e2");

        assert_eq!(next.from, "b@y");
        assert_eq!(next.to, strings(&["d@z"]));
        assert_eq!(next.cc, strings(&["a@x"]));
        assert_eq!(next.recipients, strings(&["a@x", "d@z"]));
    }

    #[test]
    fn test_forwarded_from_is_excluded() {
        let mut previous = turn("a@x", "b@y", "f@w", "b@y");
        previous.forwarded_from = strings(&["f@w"]);
        let next = Correspondents::reverse(&previous, &strings(&["b"]), &strings(&["y"]), "$e1", "$e2");
        assert_eq!(next.recipients, strings(&["a@x"]));
    }

    #[test]
    fn test_sender_domain_follows_matched_address() {
        let previous = turn("a@x", "b@second.example", "", "b@second.example");
        let domains = strings(&["first.example", "second.example"]);
        let next = Correspondents::reverse(&previous, &strings(&["b"]), &domains, "$e1", "$e2");
        assert_eq!(next.from, "b@second.example");
        assert_eq!(next.message_id, "e2@second.example");
    }

    #[test]
    fn test_no_local_match_falls_back_to_primary() {
        let previous = turn("a@x", "someone@else", "", "");
        let domains = strings(&["first.example", "second.example"]);
        let next = Correspondents::reverse(&previous, &strings(&["b"]), &domains, "$e1", "$e2");
        assert_eq!(next.from, "b@first.example");
    }

    #[test]
    fn test_missing_message_id_uses_parent_event() {
        let mut previous = turn("a@x", "b@y", "", "b@y");
        previous.message_id.clear();
        let next = Correspondents::reverse(&previous, &strings(&["b"]), &strings(&["y"]), "$parent:y", "$e2");
        assert_eq!(next.in_reply_to, "parenty@y");
        assert_eq!(next.references, strings(&["parenty@y", "e2@y"]));
    }

    #[test]
    fn test_into_email_subject() {
        let previous = turn("a@x", "b@y", "", "b@y");
        let email = Correspondents::reverse(&previous, &strings(&["b"]), &strings(&["y"]), "$e1", "$e2")
            .into_email("Thanks".to_string(), None);
        assert_eq!(email.subject, "Re: Hello");
    }

    #[test]
    fn test_event_without_fields_is_not_a_turn() {
        assert!(PreviousTurn::from_fields(&BTreeMap::new()).is_none());
    }
}
