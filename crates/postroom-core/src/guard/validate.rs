//! Sender validation for rooms that opt into `spamcheck:*` options

use super::spf::{SpfResult, SpfVerifier};
use crate::email::dkim::{DkimResult, DkimVerifier};
use crate::settings::SenderChecks;
use postroom_common::types::EmailAddress;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;

const CALLOUT_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs the sender checks a room asked for
pub struct SenderValidator {
    resolver: TokioAsyncResolver,
    spf: SpfVerifier,
    dkim: DkimVerifier,
    hostname: String,
}

impl SenderValidator {
    pub fn new(resolver: TokioAsyncResolver, hostname: &str) -> Self {
        Self {
            spf: SpfVerifier::new(resolver.clone()),
            dkim: DkimVerifier::new(resolver.clone()),
            resolver,
            hostname: hostname.to_string(),
        }
    }

    /// Check a sender; `Err` carries the reason for rejection
    pub async fn validate(
        &self,
        checks: SenderChecks,
        sender: &EmailAddress,
        client_ip: Option<IpAddr>,
        raw: &[u8],
    ) -> Result<(), String> {
        if checks.mx && self.mail_hosts(&sender.domain).await.is_empty() {
            return Err(format!("{} has no mail exchanger", sender.domain));
        }

        if checks.spf {
            if let Some(ip) = client_ip {
                let result = self.spf.verify(&sender.domain, ip).await;
                if result == SpfResult::Fail {
                    return Err(format!("SPF check failed for {} from {}", sender.domain, ip));
                }
            }
        }

        if checks.dkim {
            let result = self.dkim.verify(raw).await;
            if result != DkimResult::Pass {
                return Err(format!("DKIM verification result: {}", result.as_str()));
            }
        }

        if checks.smtp && !self.callout(sender).await {
            return Err(format!("{} is not accepted by its own mail server", sender));
        }

        Ok(())
    }

    /// MX hosts by preference, or the domain itself when it only has an address
    pub async fn mail_hosts(&self, domain: &str) -> Vec<String> {
        mail_hosts(&self.resolver, domain).await
    }

    async fn callout(&self, sender: &EmailAddress) -> bool {
        let Some(host) = self.mail_hosts(&sender.domain).await.into_iter().next() else {
            return false;
        };

        match tokio::time::timeout(CALLOUT_TIMEOUT, self.callout_host(&host, sender)).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                debug!(host = %host, "SMTP callout failed: {}", e);
                false
            }
            Err(_) => {
                debug!(host = %host, "SMTP callout timed out");
                false
            }
        }
    }

    async fn callout_host(&self, host: &str, sender: &EmailAddress) -> std::io::Result<bool> {
        let stream = TcpStream::connect((host, 25)).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        if read_reply(&mut reader).await? != 220 {
            return Ok(false);
        }

        let commands = [
            format!("EHLO {}\r\n", self.hostname),
            "MAIL FROM:<>\r\n".to_string(),
            format!("RCPT TO:<{}>\r\n", sender),
        ];
        let mut accepted = true;
        for command in &commands {
            writer.write_all(command.as_bytes()).await?;
            let code = read_reply(&mut reader).await?;
            if !(200..300).contains(&code) {
                accepted = false;
                break;
            }
        }

        writer.write_all(b"QUIT\r\n").await?;
        Ok(accepted)
    }
}

/// MX hosts of `domain` by preference, or the domain itself when it only has an address
pub async fn mail_hosts(resolver: &TokioAsyncResolver, domain: &str) -> Vec<String> {
    if let Ok(mx) = resolver.mx_lookup(domain).await {
        let mut records: Vec<(u16, String)> = mx
            .iter()
            .map(|r| {
                (
                    r.preference(),
                    r.exchange().to_utf8().trim_end_matches('.').to_string(),
                )
            })
            .filter(|(_, host)| !host.is_empty())
            .collect();
        if !records.is_empty() {
            records.sort();
            return records.into_iter().map(|(_, host)| host).collect();
        }
    }

    match resolver.lookup_ip(domain).await {
        Ok(ips) if ips.iter().next().is_some() => vec![domain.to_string()],
        _ => Vec::new(),
    }
}

/// Read a possibly multi-line SMTP reply and return its code
async fn read_reply<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<u16> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            ));
        }
        let code = line
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad reply"))?;
        if line.as_bytes().get(3) != Some(&b'-') {
            return Ok(code);
        }
    }
}
