//! DNS blackhole list voting
//!
//! Every provider is queried in parallel with its own timeout. Providers
//! that fail or time out do not vote. The address is blocked only when at
//! least one provider lists it and the listings are not outnumbered.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// A blackhole list and the answers that mean "listed"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsblProvider {
    pub host: String,
    /// Empty means any 127.0.0.0/8 answer outside 127.255.255.0/24
    pub listed: Vec<Ipv4Addr>,
}

impl DnsblProvider {
    pub fn new(host: &str, listed: &[[u8; 4]]) -> Self {
        Self {
            host: host.to_string(),
            listed: listed.iter().map(|o| Ipv4Addr::from(*o)).collect(),
        }
    }

    fn is_listing(&self, answer: &IpAddr) -> bool {
        let IpAddr::V4(answer) = answer else {
            return false;
        };
        if self.listed.is_empty() {
            let [a, b, c, _] = answer.octets();
            return a == 127 && !(b == 255 && c == 255);
        }
        self.listed.contains(answer)
    }
}

/// Built-in provider set
pub fn default_providers() -> Vec<DnsblProvider> {
    vec![
        DnsblProvider::new(
            "zen.spamhaus.org",
            &[
                [127, 0, 0, 2],
                [127, 0, 0, 3],
                [127, 0, 0, 4],
                [127, 0, 0, 9],
                [127, 0, 0, 10],
                [127, 0, 0, 11],
            ],
        ),
        DnsblProvider::new("bl.spamcop.net", &[[127, 0, 0, 2]]),
        DnsblProvider::new("b.barracudacentral.org", &[[127, 0, 0, 2]]),
        DnsblProvider::new(
            "dnsbl.sorbs.net",
            &[
                [127, 0, 0, 2],
                [127, 0, 0, 3],
                [127, 0, 0, 4],
                [127, 0, 0, 5],
                [127, 0, 0, 6],
                [127, 0, 0, 7],
                [127, 0, 0, 8],
                [127, 0, 0, 9],
                [127, 0, 0, 10],
                [127, 0, 0, 11],
                [127, 0, 0, 12],
                [127, 0, 0, 14],
            ],
        ),
        DnsblProvider::new("psbl.surriel.com", &[[127, 0, 0, 2]]),
        DnsblProvider::new("dnsbl-1.uceprotect.net", &[[127, 0, 0, 2]]),
        DnsblProvider::new(
            "bl.mailspike.net",
            &[
                [127, 0, 0, 2],
                [127, 0, 0, 10],
                [127, 0, 0, 11],
                [127, 0, 0, 12],
                [127, 0, 0, 13],
                [127, 0, 0, 14],
            ],
        ),
        DnsblProvider::new(
            "dnsbl.dronebl.org",
            &[
                [127, 0, 0, 3],
                [127, 0, 0, 5],
                [127, 0, 0, 6],
                [127, 0, 0, 7],
                [127, 0, 0, 8],
                [127, 0, 0, 9],
                [127, 0, 0, 10],
                [127, 0, 0, 11],
                [127, 0, 0, 13],
                [127, 0, 0, 14],
                [127, 0, 0, 15],
                [127, 0, 0, 16],
                [127, 0, 0, 17],
            ],
        ),
        DnsblProvider::new("all.s5h.net", &[[127, 0, 0, 2]]),
        DnsblProvider::new("ix.dnsbl.manitu.net", &[[127, 0, 0, 2]]),
    ]
}

/// Raw answer to a blackhole list query
#[derive(Debug, Clone, PartialEq)]
pub enum LookupAnswer {
    Addresses(Vec<IpAddr>),
    NotFound,
    Failed(String),
}

/// Resolves DNSBL query names
#[async_trait]
pub trait DnsblLookup: Send + Sync + 'static {
    async fn lookup(&self, name: &str) -> LookupAnswer;
}

/// Lookup through the system resolver
pub struct ResolverLookup {
    resolver: TokioAsyncResolver,
}

impl ResolverLookup {
    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl DnsblLookup for ResolverLookup {
    async fn lookup(&self, name: &str) -> LookupAnswer {
        match self.resolver.lookup_ip(name).await {
            Ok(answer) => LookupAnswer::Addresses(answer.iter().collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                LookupAnswer::NotFound
            }
            Err(e) => LookupAnswer::Failed(e.to_string()),
        }
    }
}

/// Classification of one provider's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsblOutcome {
    Listed,
    NotListed,
    Error,
}

/// Result of one check across all providers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsblVerdict {
    pub listed_by: Vec<String>,
    pub not_listed: usize,
    pub errors: usize,
}

impl DnsblVerdict {
    pub fn listed(&self) -> usize {
        self.listed_by.len()
    }

    /// Blocked unless nobody lists the address or listings are outnumbered
    pub fn blocked(&self) -> bool {
        let listed = self.listed();
        listed > 0 && listed >= self.not_listed
    }
}

/// Build the query name for `ip` at `provider`, fully qualified
pub fn query_name(ip: IpAddr, provider: &str) -> String {
    let reversed = match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{}.{}.{}.{}", d, c, b, a)
        }
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .rev()
            .flat_map(|byte| [byte & 0x0f, byte >> 4])
            .map(|nibble| format!("{:x}", nibble))
            .collect::<Vec<_>>()
            .join("."),
    };
    format!("{}.{}.", reversed, provider.trim_end_matches('.'))
}

/// Parallel multi-provider checker
pub struct Dnsbl {
    lookup: Arc<dyn DnsblLookup>,
    providers: Vec<DnsblProvider>,
    timeout: Duration,
}

impl Dnsbl {
    pub fn new(lookup: Arc<dyn DnsblLookup>, providers: Vec<DnsblProvider>, timeout: Duration) -> Self {
        Self {
            lookup,
            providers,
            timeout,
        }
    }

    /// Providers from config host names, or the built-in set when empty
    pub fn providers_from_hosts(hosts: &[String]) -> Vec<DnsblProvider> {
        if hosts.is_empty() {
            return default_providers();
        }
        let known = default_providers();
        hosts
            .iter()
            .map(|host| {
                known
                    .iter()
                    .find(|p| p.host.eq_ignore_ascii_case(host))
                    .cloned()
                    .unwrap_or_else(|| DnsblProvider::new(host, &[]))
            })
            .collect()
    }

    /// Query every provider and count the votes
    pub async fn check(&self, ip: IpAddr) -> DnsblVerdict {
        let mut tasks = JoinSet::new();

        for provider in &self.providers {
            let lookup = self.lookup.clone();
            let provider = provider.clone();
            let timeout = self.timeout;
            let name = query_name(ip, &provider.host);

            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, lookup.lookup(&name)).await {
                    Ok(LookupAnswer::Addresses(answers)) => {
                        if answers.iter().any(|a| provider.is_listing(a)) {
                            DnsblOutcome::Listed
                        } else {
                            debug!(provider = %provider.host, "Unexpected DNSBL answer {:?}", answers);
                            DnsblOutcome::Error
                        }
                    }
                    Ok(LookupAnswer::NotFound) => DnsblOutcome::NotListed,
                    Ok(LookupAnswer::Failed(e)) => {
                        debug!(provider = %provider.host, "DNSBL lookup failed: {}", e);
                        DnsblOutcome::Error
                    }
                    Err(_) => {
                        debug!(provider = %provider.host, "DNSBL lookup timed out");
                        DnsblOutcome::Error
                    }
                };
                (provider.host, outcome)
            });
        }

        let mut verdict = DnsblVerdict::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, DnsblOutcome::Listed)) => verdict.listed_by.push(host),
                Ok((_, DnsblOutcome::NotListed)) => verdict.not_listed += 1,
                Ok((_, DnsblOutcome::Error)) => verdict.errors += 1,
                Err(e) => {
                    warn!("DNSBL task failed: {}", e);
                    verdict.errors += 1;
                }
            }
        }
        verdict.listed_by.sort();

        if verdict.listed() > 0 {
            debug!(
                addr = %ip,
                listed = verdict.listed(),
                not_listed = verdict.not_listed,
                errors = verdict.errors,
                "DNSBL votes"
            );
        }
        verdict
    }
}
