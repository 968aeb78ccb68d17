//! Outbound mail transport
//!
//! One attempt per call: through a relay when one is configured, otherwise
//! directly to the recipient domain's mail exchangers.

use crate::email::cached_regex;
use crate::guard::mail_hosts;
use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use trust_dns_resolver::TokioAsyncResolver;

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Failed delivery attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying later (4xx, greylisting)
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Not worth retrying
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    /// Classify an error reported by the remote side or the SMTP client
    pub fn classify(message: impl Into<String>) -> Self {
        static TEMPORARY: OnceLock<Option<Regex>> = OnceLock::new();

        let message = message.into();
        let lower = message.to_lowercase();
        // Only the leading reply code counts, after lettre's "... error (NNN)" prefix
        let temporary_code = cached_regex(
            &TEMPORARY,
            r"(?i)^\s*(?:(?:permanent|transient) error \(4\d\d\)|4\d\d\b|4\.\d{1,3}\.\d{1,3}\b)",
        )
        .is_some_and(|re| re.is_match(&message));

        if temporary_code
            || lower.contains("greylist")
            || lower.contains("graylist")
            || lower.contains("temporarily")
            || lower.contains("try again later")
        {
            DeliveryError::Transient(message)
        } else {
            DeliveryError::Permanent(message)
        }
    }
}

/// Sends raw messages to remote servers
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        from: &str,
        to: &[String],
        data: &[u8],
        relay_override: Option<&str>,
    ) -> Result<(), DeliveryError>;
}

/// Split recipients into per-domain batches, keeping first-seen order
pub fn group_by_domain(recipients: &[String]) -> Vec<Vec<String>> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for recipient in recipients {
        let domain = recipient
            .rsplit_once('@')
            .map(|(_, d)| d.to_lowercase())
            .unwrap_or_default();
        match groups.iter_mut().find(|(d, _)| *d == domain) {
            Some((_, group)) => group.push(recipient.clone()),
            None => groups.push((domain, vec![recipient.clone()])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

fn envelope(from: &str, to: &[String]) -> Result<Envelope, DeliveryError> {
    let from: Address = from
        .parse()
        .map_err(|e| DeliveryError::Permanent(format!("Invalid sender {}: {}", from, e)))?;
    let to = to
        .iter()
        .map(|rcpt| {
            rcpt.parse::<Address>()
                .map_err(|e| DeliveryError::Permanent(format!("Invalid recipient {}: {}", rcpt, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Envelope::new(Some(from), to)
        .map_err(|e| DeliveryError::Permanent(format!("Invalid envelope: {}", e)))
}

fn smtp_error(e: lettre::transport::smtp::Error) -> DeliveryError {
    if e.is_transient() || e.is_timeout() {
        DeliveryError::Transient(e.to_string())
    } else {
        DeliveryError::classify(e.to_string())
    }
}

/// lettre-based transport
pub struct SmtpMailer {
    hostname: String,
    default_relay: Option<String>,
    resolver: TokioAsyncResolver,
}

impl SmtpMailer {
    pub fn new(hostname: &str, default_relay: Option<String>, resolver: TokioAsyncResolver) -> Self {
        Self {
            hostname: hostname.to_string(),
            default_relay: default_relay.filter(|r| !r.trim().is_empty()),
            resolver,
        }
    }

    async fn send_via_relay(
        &self,
        relay: &str,
        envelope: &Envelope,
        data: &[u8],
    ) -> Result<(), DeliveryError> {
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::from_url(relay)
            .map_err(|e| DeliveryError::Permanent(format!("Invalid relay URL: {}", e)))?
            .hello_name(ClientId::Domain(self.hostname.clone()))
            .timeout(Some(SMTP_TIMEOUT))
            .build();

        mailer.send_raw(envelope, data).await.map_err(smtp_error)?;
        Ok(())
    }

    async fn send_direct(
        &self,
        to: &[String],
        envelope: &Envelope,
        data: &[u8],
    ) -> Result<(), DeliveryError> {
        let domain = to
            .first()
            .and_then(|rcpt| rcpt.rsplit_once('@'))
            .map(|(_, d)| d.to_string())
            .ok_or_else(|| DeliveryError::Permanent("No recipients".to_string()))?;

        let hosts = mail_hosts(&self.resolver, &domain).await;
        if hosts.is_empty() {
            return Err(DeliveryError::Permanent(format!(
                "{} has no mail exchanger",
                domain
            )));
        }

        let mut last_error = DeliveryError::Permanent(format!("No reachable host for {}", domain));
        for host in hosts {
            let tls = match TlsParameters::new(host.clone()) {
                Ok(params) => Tls::Opportunistic(params),
                Err(e) => {
                    debug!(host = %host, "TLS parameters unavailable: {}", e);
                    Tls::None
                }
            };
            let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host.as_str())
                .port(25)
                .hello_name(ClientId::Domain(self.hostname.clone()))
                .tls(tls)
                .timeout(Some(SMTP_TIMEOUT))
                .build();

            match mailer.send_raw(envelope, data).await {
                Ok(_) => {
                    debug!(host = %host, domain = %domain, "Delivered directly");
                    return Ok(());
                }
                Err(e) => {
                    let error = smtp_error(e);
                    warn!(host = %host, domain = %domain, "Direct delivery failed: {}", error);
                    // A definite answer from a reachable exchanger ends the attempt
                    if !error.is_transient() {
                        return Err(error);
                    }
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl Transport for SmtpMailer {
    async fn send(
        &self,
        from: &str,
        to: &[String],
        data: &[u8],
        relay_override: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let envelope = envelope(from, to)?;
        let relay = relay_override
            .filter(|r| !r.trim().is_empty())
            .or(self.default_relay.as_deref());

        match relay {
            Some(relay) => self.send_via_relay(relay, &envelope, data).await?,
            None => self.send_direct(to, &envelope, data).await?,
        }

        info!(from = %from, to = ?to, relayed = relay.is_some(), "Email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_classify_temporary_codes() {
        assert!(DeliveryError::classify("451 4.7.1 Please try again").is_transient());
        assert!(DeliveryError::classify("421 service not available").is_transient());
        assert!(DeliveryError::classify("transient error (450): mailbox busy").is_transient());
        assert!(DeliveryError::classify("4.2.2 mailbox full").is_transient());
        assert!(DeliveryError::classify("Greylisted, see https://example").is_transient());
        assert!(DeliveryError::classify("mailbox temporarily unavailable").is_transient());
    }

    #[test]
    fn test_classify_permanent() {
        assert!(!DeliveryError::classify("550 5.1.1 User unknown").is_transient());
        assert!(!DeliveryError::classify("connection refused").is_transient());
        assert!(!DeliveryError::classify("message size 14000 exceeds limit").is_transient());
    }

    #[test]
    fn test_classify_ignores_codes_inside_text() {
        assert!(!DeliveryError::classify(
            "permanent error (550): 5.1.1 <bob@mx401.example.com>: Recipient address rejected"
        )
        .is_transient());
        assert!(!DeliveryError::classify("554 5.7.1 Message rejected, see https://example.com/err/421")
            .is_transient());
        assert!(!DeliveryError::classify("550 5.1.1 mailbox unavailable (ref 450)").is_transient());
    }

    #[test]
    fn test_group_by_domain() {
        let recipients: Vec<String> = ["a@x", "b@y", "c@X", "d@y"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            group_by_domain(&recipients),
            vec![
                vec!["a@x".to_string(), "c@X".to_string()],
                vec!["b@y".to_string(), "d@y".to_string()],
            ]
        );
    }

    #[test]
    fn test_envelope_rejects_bad_addresses() {
        assert!(envelope("sales@example.com", &["alice@example.org".to_string()]).is_ok());
        assert!(matches!(
            envelope("sales@example.com", &["nope".to_string()]),
            Err(DeliveryError::Permanent(_))
        ));
        assert!(envelope("sales@example.com", &[]).is_err());
    }
}
