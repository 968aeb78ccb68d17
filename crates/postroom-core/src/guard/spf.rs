//! SPF evaluation (RFC 7208) for the `spamcheck:spf` room option

use anyhow::{anyhow, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// DNS-querying terms allowed per evaluation
const MAX_DNS_LOOKUPS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

#[derive(Debug, Clone, PartialEq)]
enum Mechanism {
    All,
    Include(String),
    A(Option<String>, Option<u8>),
    Mx(Option<String>, Option<u8>),
    Ip4(Ipv4Net),
    Ip6(Ipv6Net),
    Exists(String),
    Ptr,
}

impl Mechanism {
    fn needs_lookup(&self) -> bool {
        matches!(
            self,
            Mechanism::Include(_)
                | Mechanism::A(..)
                | Mechanism::Mx(..)
                | Mechanism::Exists(_)
                | Mechanism::Ptr
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Directive {
    qualifier: SpfResult,
    mechanism: Mechanism,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Record {
    directives: Vec<Directive>,
    redirect: Option<String>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// SPF verifier backed by the system resolver
pub struct SpfVerifier {
    resolver: TokioAsyncResolver,
}

impl SpfVerifier {
    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }

    /// Evaluate SPF for `domain` and the connecting IP
    pub async fn verify(&self, domain: &str, client_ip: IpAddr) -> SpfResult {
        let lookups = AtomicUsize::new(0);
        match self.check_host(domain, client_ip, &lookups).await {
            Ok(result) => {
                debug!(domain = %domain, ip = %client_ip, "SPF result {:?}", result);
                result
            }
            Err(e) => {
                warn!(domain = %domain, "SPF evaluation error: {}", e);
                SpfResult::TempError
            }
        }
    }

    fn check_host<'a>(
        &'a self,
        domain: &'a str,
        client_ip: IpAddr,
        lookups: &'a AtomicUsize,
    ) -> BoxFuture<'a, Result<SpfResult>> {
        Box::pin(async move {
            let record = match self.fetch_record(domain).await {
                Ok(Some(text)) => match parse_record(&text) {
                    Ok(record) => record,
                    Err(e) => {
                        debug!(domain = %domain, "Invalid SPF record: {}", e);
                        return Ok(SpfResult::PermError);
                    }
                },
                Ok(None) => return Ok(SpfResult::None),
                Err(e) => {
                    debug!(domain = %domain, "SPF record lookup failed: {}", e);
                    return Ok(SpfResult::TempError);
                }
            };

            for directive in &record.directives {
                if directive.mechanism.needs_lookup()
                    && lookups.fetch_add(1, Ordering::SeqCst) >= MAX_DNS_LOOKUPS
                {
                    return Ok(SpfResult::PermError);
                }

                match self
                    .matches(&directive.mechanism, domain, client_ip, lookups)
                    .await?
                {
                    Match::Yes => return Ok(directive.qualifier),
                    Match::No => continue,
                    Match::Error(result) => return Ok(result),
                }
            }

            if let Some(target) = &record.redirect {
                if lookups.fetch_add(1, Ordering::SeqCst) >= MAX_DNS_LOOKUPS {
                    return Ok(SpfResult::PermError);
                }
                return match self.check_host(target, client_ip, lookups).await? {
                    SpfResult::None => Ok(SpfResult::PermError),
                    result => Ok(result),
                };
            }

            Ok(SpfResult::Neutral)
        })
    }

    async fn matches(
        &self,
        mechanism: &Mechanism,
        domain: &str,
        client_ip: IpAddr,
        lookups: &AtomicUsize,
    ) -> Result<Match> {
        let matched = match mechanism {
            Mechanism::All => true,
            Mechanism::Ip4(net) => matches!(client_ip, IpAddr::V4(ip) if net.contains(&ip)),
            Mechanism::Ip6(net) => matches!(client_ip, IpAddr::V6(ip) if net.contains(&ip)),
            Mechanism::A(target, prefix) => {
                let target = target.as_deref().unwrap_or(domain);
                self.host_matches(target, client_ip, *prefix).await
            }
            Mechanism::Mx(target, prefix) => {
                let target = target.as_deref().unwrap_or(domain);
                let mut matched = false;
                if let Ok(mx) = self.resolver.mx_lookup(target).await {
                    for record in mx.iter() {
                        let host = record.exchange().to_utf8();
                        if self.host_matches(&host, client_ip, *prefix).await {
                            matched = true;
                            break;
                        }
                    }
                }
                matched
            }
            Mechanism::Include(target) => {
                match self.check_host(target, client_ip, lookups).await? {
                    SpfResult::Pass => true,
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => false,
                    SpfResult::TempError => return Ok(Match::Error(SpfResult::TempError)),
                    SpfResult::PermError | SpfResult::None => {
                        return Ok(Match::Error(SpfResult::PermError))
                    }
                }
            }
            Mechanism::Exists(target) => self.resolver.ipv4_lookup(target.as_str()).await.is_ok(),
            // deprecated and not evaluated
            Mechanism::Ptr => false,
        };

        Ok(if matched { Match::Yes } else { Match::No })
    }

    async fn host_matches(&self, host: &str, client_ip: IpAddr, prefix: Option<u8>) -> bool {
        match client_ip {
            IpAddr::V4(ip) => {
                let Ok(lookup) = self.resolver.ipv4_lookup(host).await else {
                    return false;
                };
                lookup.iter().any(|record| {
                    let addr: std::net::Ipv4Addr = (*record).into();
                    Ipv4Net::new(addr, prefix.unwrap_or(32))
                        .map(|net| net.contains(&ip))
                        .unwrap_or(false)
                })
            }
            IpAddr::V6(ip) => {
                let Ok(lookup) = self.resolver.ipv6_lookup(host).await else {
                    return false;
                };
                lookup.iter().any(|record| {
                    let addr: std::net::Ipv6Addr = (*record).into();
                    Ipv6Net::new(addr, prefix.unwrap_or(128))
                        .map(|net| net.contains(&ip))
                        .unwrap_or(false)
                })
            }
        }
    }

    async fn fetch_record(&self, domain: &str) -> Result<Option<String>> {
        let lookup = match self.resolver.txt_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return Ok(None)
            }
            Err(e) => return Err(anyhow!("TXT lookup failed: {}", e)),
        };

        let records: Vec<String> = lookup
            .iter()
            .map(|record| {
                record
                    .txt_data()
                    .iter()
                    .map(|d| String::from_utf8_lossy(d))
                    .collect::<String>()
            })
            .filter(|txt| txt == "v=spf1" || txt.starts_with("v=spf1 "))
            .collect();

        match records.len() {
            0 => Ok(None),
            1 => Ok(records.into_iter().next()),
            _ => Err(anyhow!("multiple SPF records")),
        }
    }
}

enum Match {
    Yes,
    No,
    Error(SpfResult),
}

fn parse_record(text: &str) -> Result<Record> {
    let terms = text
        .strip_prefix("v=spf1")
        .ok_or_else(|| anyhow!("missing v=spf1"))?;

    let mut record = Record::default();
    for term in terms.split_whitespace() {
        if let Some((name, value)) = term.split_once('=') {
            if name.eq_ignore_ascii_case("redirect") {
                record.redirect = Some(value.to_string());
            }
            continue;
        }

        let (qualifier, rest) = match term.as_bytes().first() {
            Some(b'+') => (SpfResult::Pass, &term[1..]),
            Some(b'-') => (SpfResult::Fail, &term[1..]),
            Some(b'~') => (SpfResult::SoftFail, &term[1..]),
            Some(b'?') => (SpfResult::Neutral, &term[1..]),
            _ => (SpfResult::Pass, term),
        };

        record.directives.push(Directive {
            qualifier,
            mechanism: parse_mechanism(rest)?,
        });
    }

    Ok(record)
}

fn split_prefix(value: &str) -> Result<(Option<String>, Option<u8>)> {
    let (target, prefix) = match value.split_once('/') {
        Some((target, prefix)) => (target, Some(prefix.parse::<u8>()?)),
        None => (value, None),
    };
    let target = target.strip_prefix(':').unwrap_or(target);
    Ok(((!target.is_empty()).then(|| target.to_string()), prefix))
}

fn parse_mechanism(term: &str) -> Result<Mechanism> {
    let lower = term.to_ascii_lowercase();

    if lower == "all" {
        return Ok(Mechanism::All);
    }
    if let Some(rest) = lower.strip_prefix("include:") {
        return Ok(Mechanism::Include(rest.to_string()));
    }
    if let Some(rest) = lower.strip_prefix("exists:") {
        return Ok(Mechanism::Exists(rest.to_string()));
    }
    if lower == "ptr" || lower.starts_with("ptr:") {
        return Ok(Mechanism::Ptr);
    }
    if let Some(rest) = lower.strip_prefix("ip4:") {
        let net = if rest.contains('/') {
            rest.parse()?
        } else {
            Ipv4Net::new(rest.parse()?, 32)?
        };
        return Ok(Mechanism::Ip4(net));
    }
    if let Some(rest) = lower.strip_prefix("ip6:") {
        let net = if rest.contains('/') {
            rest.parse()?
        } else {
            Ipv6Net::new(rest.parse()?, 128)?
        };
        return Ok(Mechanism::Ip6(net));
    }
    if let Some(rest) = lower.strip_prefix("mx") {
        if rest.is_empty() || rest.starts_with(':') || rest.starts_with('/') {
            let (target, prefix) = split_prefix(rest)?;
            return Ok(Mechanism::Mx(target, prefix));
        }
    }
    if let Some(rest) = lower.strip_prefix('a') {
        if rest.is_empty() || rest.starts_with(':') || rest.starts_with('/') {
            let (target, prefix) = split_prefix(rest)?;
            return Ok(Mechanism::A(target, prefix));
        }
    }

    Err(anyhow!("unknown mechanism {}", term))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_record() {
        let record =
            parse_record("v=spf1 ip4:192.0.2.0/24 a mx:mail.example.com/24 include:_spf.example.net ~all redirect=other.example")
                .unwrap();

        assert_eq!(record.directives.len(), 5);
        assert_eq!(
            record.directives[0].mechanism,
            Mechanism::Ip4("192.0.2.0/24".parse().unwrap())
        );
        assert_eq!(record.directives[1].mechanism, Mechanism::A(None, None));
        assert_eq!(
            record.directives[2].mechanism,
            Mechanism::Mx(Some("mail.example.com".to_string()), Some(24))
        );
        assert_eq!(record.directives[4].qualifier, SpfResult::SoftFail);
        assert_eq!(record.redirect.as_deref(), Some("other.example"));
    }

    #[test]
    fn test_single_ip_gets_host_prefix() {
        let record = parse_record("v=spf1 ip4:192.0.2.1 ip6:2001:db8::1 -all").unwrap();
        assert_eq!(
            record.directives[0].mechanism,
            Mechanism::Ip4("192.0.2.1/32".parse().unwrap())
        );
        assert_eq!(
            record.directives[1].mechanism,
            Mechanism::Ip6("2001:db8::1/128".parse().unwrap())
        );
    }

    #[test]
    fn test_invalid_records() {
        assert!(parse_record("spf2.0/pra").is_err());
        assert!(parse_record("v=spf1 bogus:thing").is_err());
        assert!(parse_record("v=spf1 ip4:not-an-ip").is_err());
    }
}
