//! Abuse guard
//!
//! Inbound defenses: trusted proxies, greylist, banlist and DNSBL voting.
//! The lists are process-wide records in the store, each mutated under its
//! own keyed lock. Addresses are keyed by bare IP so a changing source port
//! cannot dodge a listing.

mod dnsbl;
mod spf;
mod validate;

pub use dnsbl::{
    default_providers, query_name, Dnsbl, DnsblLookup, DnsblOutcome, DnsblProvider, DnsblVerdict,
    LookupAnswer, ResolverLookup,
};
pub use spf::{SpfResult, SpfVerifier};
pub use validate::{mail_hosts, SenderValidator};

use crate::locks::KeyedLocks;
use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use postroom_common::Result;
use postroom_storage::{KvStore, Record};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Store key of the greylist blob
pub const GREYLIST_KEY: &str = "guard.greylist";

/// Store key of the banlist blob
pub const BANLIST_KEY: &str = "guard.banlist";

/// Runtime-adjustable guard switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardPolicy {
    /// Greylist window in minutes; zero disables greylisting
    pub greylist_minutes: u64,
    pub banlist: bool,
    pub banlist_auto: bool,
}

/// Why an address was banned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    Auto,
    Auth,
    Manual,
}

/// Strip the port (and IPv6 brackets) from a client address
pub fn bare_ip(addr: &str) -> String {
    let addr = addr.trim();
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return ip.to_string();
    }
    let unbracketed = addr.trim_start_matches('[').split(']').next().unwrap_or(addr);
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return ip.to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host.to_string(),
        _ => addr.to_string(),
    }
}

fn parse_trusted(entries: &[String]) -> Vec<IpNet> {
    entries
        .iter()
        .filter_map(|entry| {
            let entry = entry.trim();
            entry
                .parse::<IpNet>()
                .ok()
                .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from))
                .or_else(|| {
                    warn!("Ignoring invalid trusted proxy {}", entry);
                    None
                })
        })
        .collect()
}

/// Abuse guard state and decisions
pub struct AbuseGuard {
    store: Arc<dyn KvStore>,
    locks: Arc<KeyedLocks>,
    trusted: Vec<IpNet>,
    policy: RwLock<GuardPolicy>,
    dnsbl: Option<Dnsbl>,
}

impl AbuseGuard {
    pub fn new(
        store: Arc<dyn KvStore>,
        locks: Arc<KeyedLocks>,
        trusted_proxies: &[String],
        dnsbl: Option<Dnsbl>,
    ) -> Self {
        Self {
            store,
            locks,
            trusted: parse_trusted(trusted_proxies),
            policy: RwLock::new(GuardPolicy::default()),
            dnsbl,
        }
    }

    pub async fn set_policy(&self, policy: GuardPolicy) {
        *self.policy.write().await = policy;
    }

    pub async fn policy(&self) -> GuardPolicy {
        *self.policy.read().await
    }

    /// Whether the address belongs to a trusted proxy
    pub fn is_trusted(&self, addr: &str) -> bool {
        match bare_ip(addr).parse::<IpAddr>() {
            Ok(ip) => self.trusted.iter().any(|net| net.contains(&ip)),
            Err(_) => false,
        }
    }

    /// Greylist check; the first contact records the address and is greylisted
    pub async fn is_greylisted(&self, addr: &str) -> bool {
        self.is_greylisted_at(addr, Utc::now()).await
    }

    /// Greylist check as of `now`
    pub async fn is_greylisted_at(&self, addr: &str, now: DateTime<Utc>) -> bool {
        let minutes = self.policy().await.greylist_minutes;
        if minutes == 0 || self.is_trusted(addr) {
            return false;
        }
        let window = Duration::minutes(minutes as i64);
        let key = bare_ip(addr);

        let _guard = self.locks.lock(GREYLIST_KEY).await;
        let mut greylist = self.load(GREYLIST_KEY).await;

        // Expired entries of other hosts go; this host's entry decides below
        let before = greylist.len();
        greylist.retain(|ip, seen| {
            ip == &key || parse_time(seen).is_some_and(|first_seen| now < first_seen + window)
        });
        let pruned = before - greylist.len();

        if let Some(first_seen) = greylist.get(&key).and_then(|v| parse_time(v)) {
            if pruned > 0 {
                debug!(pruned, "Pruned expired greylist entries");
                self.save_greylist(&key, greylist).await;
            }
            return now < first_seen + window;
        }

        greylist.insert(key.clone(), now.to_rfc3339());
        self.save_greylist(&key, greylist).await;
        debug!(addr = %key, "Greylisted first contact");
        true
    }

    async fn save_greylist(&self, addr: &str, greylist: Record) {
        if let Err(e) = self.store.set(GREYLIST_KEY, greylist).await {
            warn!(addr = %addr, "Failed to store greylist: {}", e);
        }
    }

    /// Whether the address is on the banlist
    pub async fn is_banned(&self, addr: &str) -> bool {
        if !self.policy().await.banlist || self.is_trusted(addr) {
            return false;
        }
        self.load(BANLIST_KEY).await.contains_key(&bare_ip(addr))
    }

    /// Ban after mail to an unknown recipient, if automatic banning is on
    pub async fn ban_auto(&self, addr: &str) -> bool {
        if !self.policy().await.banlist_auto {
            return false;
        }
        self.ban(addr, BanReason::Auto).await
    }

    /// Ban after malformed authentication
    pub async fn ban_auth(&self, addr: &str) -> bool {
        self.ban(addr, BanReason::Auth).await
    }

    /// Ban on an admin's request
    pub async fn ban_manually(&self, addr: &str) -> bool {
        self.ban(addr, BanReason::Manual).await
    }

    async fn ban(&self, addr: &str, reason: BanReason) -> bool {
        if !self.policy().await.banlist || self.is_trusted(addr) {
            return false;
        }
        let key = bare_ip(addr);

        let _guard = self.locks.lock(BANLIST_KEY).await;
        let mut banlist = self.load(BANLIST_KEY).await;
        if banlist.contains_key(&key) {
            return true;
        }
        banlist.insert(key.clone(), Utc::now().to_rfc3339());
        match self.store.set(BANLIST_KEY, banlist).await {
            Ok(()) => {
                info!(addr = %key, reason = ?reason, "Banned address");
                true
            }
            Err(e) => {
                warn!(addr = %key, "Failed to store ban: {}", e);
                false
            }
        }
    }

    /// Remove an address from the banlist
    pub async fn unban(&self, addr: &str) -> Result<bool> {
        let key = bare_ip(addr);
        let _guard = self.locks.lock(BANLIST_KEY).await;
        let mut banlist = self.load(BANLIST_KEY).await;
        if banlist.remove(&key).is_none() {
            return Ok(false);
        }
        self.store.set(BANLIST_KEY, banlist).await?;
        info!(addr = %key, "Unbanned address");
        Ok(true)
    }

    /// Banned addresses with the time they were banned, sorted by address
    pub async fn banlist(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self.load(BANLIST_KEY).await.into_iter().collect();
        entries.sort();
        entries
    }

    /// Clear the banlist
    pub async fn reset_banlist(&self) -> Result<()> {
        let _guard = self.locks.lock(BANLIST_KEY).await;
        self.store.set(BANLIST_KEY, Record::new()).await?;
        info!("Banlist reset");
        Ok(())
    }

    /// Whether the DNSBL providers vote to block the address
    pub async fn check_dnsbls(&self, addr: &str) -> bool {
        let Some(dnsbl) = &self.dnsbl else {
            return false;
        };
        if self.is_trusted(addr) {
            return false;
        }
        let Ok(ip) = bare_ip(addr).parse::<IpAddr>() else {
            return false;
        };

        let verdict = dnsbl.check(ip).await;
        if verdict.blocked() {
            info!(addr = %ip, listed_by = ?verdict.listed_by, "Blocked by DNSBL");
        }
        verdict.blocked()
    }

    async fn load(&self, key: &str) -> Record {
        match self.store.get(key).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                Record::new()
            }
        }
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use postroom_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    fn guard(policy: GuardPolicy) -> AbuseGuard {
        let guard = AbuseGuard::new(
            Arc::new(MemoryStore::new()),
            Arc::new(KeyedLocks::new()),
            &["10.0.0.0/8".to_string(), "192.0.2.1".to_string()],
            None,
        );
        *guard.policy.try_write().unwrap() = policy;
        guard
    }

    #[test]
    fn test_bare_ip() {
        assert_eq!(bare_ip("203.0.113.5:40123"), "203.0.113.5");
        assert_eq!(bare_ip("203.0.113.5"), "203.0.113.5");
        assert_eq!(bare_ip("[2001:db8::1]:25"), "2001:db8::1");
        assert_eq!(bare_ip("2001:db8::1"), "2001:db8::1");
        assert_eq!(bare_ip("mail.example.com:25"), "mail.example.com");
    }

    #[test]
    fn test_trusted_proxies() {
        let guard = guard(GuardPolicy::default());
        assert!(guard.is_trusted("10.1.2.3:5555"));
        assert!(guard.is_trusted("192.0.2.1"));
        assert!(!guard.is_trusted("192.0.2.2"));
        assert!(!guard.is_trusted("garbage"));
    }

    #[tokio::test]
    async fn test_greylist_disabled() {
        let guard = guard(GuardPolicy::default());
        assert!(!guard.is_greylisted("203.0.113.5:1").await);
    }

    #[tokio::test]
    async fn test_greylist_first_contact_and_window() {
        let guard = guard(GuardPolicy {
            greylist_minutes: 5,
            ..Default::default()
        });
        let start = Utc::now();

        assert!(guard.is_greylisted_at("203.0.113.5:1000", start).await);
        // another port of the same host stays greylisted within the window
        assert!(
            guard
                .is_greylisted_at("203.0.113.5:2000", start + Duration::minutes(4))
                .await
        );
        assert!(
            !guard
                .is_greylisted_at("203.0.113.5:3000", start + Duration::minutes(6))
                .await
        );
        assert!(!guard.is_greylisted_at("10.0.0.1:1", start).await);
    }

    #[tokio::test]
    async fn test_greylist_prunes_expired_entries() {
        let guard = guard(GuardPolicy {
            greylist_minutes: 5,
            ..Default::default()
        });
        let start = Utc::now();

        assert!(guard.is_greylisted_at("203.0.113.5:1", start).await);
        assert!(guard.is_greylisted_at("203.0.113.6:1", start + Duration::minutes(3)).await);
        assert!(guard.is_greylisted_at("203.0.113.7:1", start + Duration::minutes(7)).await);

        let greylist = guard.store.get(GREYLIST_KEY).await.unwrap();
        let mut hosts: Vec<&str> = greylist.keys().map(String::as_str).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["203.0.113.6", "203.0.113.7"]);

        // an expired host keeps its own entry and passes
        assert!(!guard.is_greylisted_at("203.0.113.6:1", start + Duration::minutes(20)).await);
        let greylist = guard.store.get(GREYLIST_KEY).await.unwrap();
        assert_eq!(greylist.keys().map(String::as_str).collect::<Vec<_>>(), vec!["203.0.113.6"]);
    }

    #[tokio::test]
    async fn test_ban_requires_banlist() {
        let guard = guard(GuardPolicy::default());
        assert!(!guard.ban_manually("203.0.113.9").await);
        assert!(!guard.is_banned("203.0.113.9").await);
    }

    #[tokio::test]
    async fn test_ban_auto_requires_subfeature() {
        let guard = guard(GuardPolicy {
            banlist: true,
            ..Default::default()
        });
        assert!(!guard.ban_auto("203.0.113.9:25").await);
        assert!(guard.ban_auth("203.0.113.9:25").await);
        assert!(guard.is_banned("203.0.113.9:4444").await);

        guard
            .set_policy(GuardPolicy {
                banlist: true,
                banlist_auto: true,
                ..Default::default()
            })
            .await;
        assert!(guard.ban_auto("198.51.100.1:25").await);
        assert_eq!(guard.banlist().await.len(), 2);
    }

    #[tokio::test]
    async fn test_trusted_never_banned() {
        let guard = guard(GuardPolicy {
            banlist: true,
            banlist_auto: true,
            ..Default::default()
        });
        assert!(!guard.ban_manually("10.0.0.7").await);
        assert!(!guard.is_banned("10.0.0.7").await);
    }

    #[tokio::test]
    async fn test_unban_and_reset() {
        let guard = guard(GuardPolicy {
            banlist: true,
            ..Default::default()
        });
        guard.ban_manually("203.0.113.1").await;
        guard.ban_manually("203.0.113.2").await;

        assert!(guard.unban("203.0.113.1:99").await.unwrap());
        assert!(!guard.unban("203.0.113.1").await.unwrap());
        assert!(guard.is_banned("203.0.113.2").await);

        guard.reset_banlist().await.unwrap();
        assert!(guard.banlist().await.is_empty());
    }

    #[tokio::test]
    async fn test_dnsbl_disabled_never_blocks() {
        let guard = guard(GuardPolicy::default());
        assert!(!guard.check_dnsbls("203.0.113.5").await);
    }
}
