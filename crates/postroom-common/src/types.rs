//! Common types for Postroom

use serde::{Deserialize, Serialize};

/// Chat room identifier
pub type RoomId = String;

/// Chat event identifier
pub type EventId = String;

/// Chat user identifier
pub type UserId = String;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse a bare `local@domain` address
    pub fn parse(s: &str) -> Option<Self> {
        let (local, domain) = s.trim().rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
            return None;
        }
        Some(Self::new(local, domain.to_lowercase()))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Message envelope (SMTP level)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender (MAIL FROM)
    pub from: Option<EmailAddress>,

    /// Recipients (RCPT TO)
    pub to: Vec<EmailAddress>,

    /// Client address as seen by the listener (may carry a port)
    pub client_addr: Option<String>,

    /// HELO/EHLO hostname
    pub helo: Option<String>,
}

/// Normalize a mailbox name: trimmed and lowercased
pub fn normalize_mailbox(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Extract the bare address out of `Name <addr>` or `addr`, lowercased
pub fn bare_address(entry: &str) -> Option<String> {
    let entry = entry.trim();
    let addr = match (entry.rfind('<'), entry.rfind('>')) {
        (Some(start), Some(end)) if start < end => &entry[start + 1..end],
        _ => entry,
    };
    let addr = addr.trim().trim_matches('"');
    EmailAddress::parse(addr).map(|a| a.to_string().to_lowercase())
}

/// Split an address-list header value into bare addresses.
///
/// Commas inside quoted display names and angle brackets do not split.
pub fn parse_address_list(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for c in value.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' | ';' if !in_quotes && !in_angle => {
                entries.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    entries.push(current);

    let mut addresses: Vec<String> = Vec::new();
    for entry in entries {
        if let Some(addr) = bare_address(&entry) {
            if !addresses.contains(&addr) {
                addresses.push(addr);
            }
        }
    }
    addresses
}

/// Match `value` against a pattern where `*` stands for any run of characters.
///
/// Matching is case-insensitive.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let value: Vec<char> = value.to_lowercase().chars().collect();

    let (mut p, mut v) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while v < value.len() {
        if p < pattern.len() && pattern[p] != '*' && pattern[p] == value[v] {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = v;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            v = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@Example.COM").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
    }

    #[test]
    fn test_parse_address_list() {
        let list = parse_address_list(
            r#""Doe, John" <John@x.com>, b@y.com; <c@y.com>, not-an-address, b@y.com"#,
        );
        assert_eq!(list, vec!["john@x.com", "b@y.com", "c@y.com"]);
        assert!(parse_address_list("").is_empty());
    }

    #[test]
    fn test_bare_address() {
        assert_eq!(bare_address("Alice <alice@x.com>"), Some("alice@x.com".to_string()));
        assert_eq!(bare_address(" bob@y.com "), Some("bob@y.com".to_string()));
        assert_eq!(bare_address("nobody"), None);
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*@spam.example", "bot@spam.example"));
        assert!(wildcard_match("bot*@*", "BOT42@anything.org"));
        assert!(wildcard_match("exact@x.com", "exact@x.com"));
        assert!(!wildcard_match("*@spam.example", "bot@ham.example"));
        assert!(!wildcard_match("a*b", "acbd"));
        assert!(wildcard_match("*", ""));
    }
}
