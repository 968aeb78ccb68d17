//! Configuration for Postroom
//!
//! Static settings come from a TOML file. Settings that room owners and
//! admins change at runtime live in the keyed store instead.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// SMTP configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// TLS configuration
    pub tls: Option<TlsConfig>,

    /// Chat homeserver configuration
    pub matrix: MatrixConfig,

    /// Mail domains and access control
    pub mail: MailConfig,

    /// DKIM signing configuration
    pub dkim: Option<DkimConfig>,

    /// DNS blackhole list configuration
    #[serde(default)]
    pub dnsbl: DnsblConfig,

    /// Delivery queue trigger
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in banners and generated identifiers
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

/// SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Bind host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// SMTP port (inbound)
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Submission port (authenticated sending)
    #[serde(default = "default_submission_port")]
    pub submission_port: u16,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum recipients per message
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum concurrent connections
    #[serde(default = "default_smtp_max_connections")]
    pub max_connections: usize,

    /// Idle timeout per command in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            submission_port: default_submission_port(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            max_connections: default_smtp_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

fn default_smtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_submission_port() -> u16 {
    587
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024 // 25 MB
}

fn default_max_recipients() -> usize {
    50
}

fn default_smtp_max_connections() -> usize {
    100
}

fn default_connection_timeout() -> u64 {
    300
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_path: PathBuf,

    /// Path to private key file
    pub key_path: PathBuf,
}

/// Chat homeserver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Homeserver base URL
    pub homeserver: String,

    /// Access token of the bot account
    pub access_token: String,

    /// Command prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Long-poll timeout for sync in seconds
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
}

fn default_prefix() -> String {
    "!pm".to_string()
}

fn default_sync_timeout() -> u64 {
    30
}

/// Mail domains and access control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Locally-owned domains; the first one is the primary domain
    pub domains: Vec<String>,

    /// Admin user patterns (`*` wildcards allowed, e.g. `@*:example.com`)
    #[serde(default)]
    pub admins: Vec<String>,

    /// Users allowed to invite the bot; empty allows everyone
    #[serde(default)]
    pub users: Vec<String>,

    /// Trusted proxies (IPs or CIDRs) exempt from listing
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Mailbox names only admins may claim
    #[serde(default = "default_reserved")]
    pub reserved: Vec<String>,

    /// Relay used for every outbound email unless a room overrides it
    pub relay: Option<String>,
}

impl MailConfig {
    /// Primary domain used when no better match is known
    pub fn primary_domain(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or("localhost")
    }
}

fn default_reserved() -> Vec<String> {
    ["abuse", "postmaster", "hostmaster", "webmaster", "root"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// DKIM signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimConfig {
    /// Selector (s= tag)
    #[serde(default = "default_selector")]
    pub selector: String,

    /// Path to the PKCS#8 PEM private key
    pub private_key_path: PathBuf,
}

fn default_selector() -> String {
    "postroom".to_string()
}

/// DNS blackhole list configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsblConfig {
    /// Enable DNSBL checks on inbound connections
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-provider lookup timeout in milliseconds
    #[serde(default = "default_dnsbl_timeout")]
    pub timeout_ms: u64,

    /// Provider hostnames; empty means the built-in provider set
    #[serde(default)]
    pub providers: Vec<String>,
}

impl Default for DnsblConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_dnsbl_timeout(),
            providers: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_dnsbl_timeout() -> u64 {
    2000
}

/// Delivery queue trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds between queue sweeps
    #[serde(default = "default_queue_interval")]
    pub interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_queue_interval(),
        }
    }
}

fn default_queue_interval() -> u64 {
    300
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info,postroom=debug".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `$POSTROOM_CONFIG` or the default locations
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("POSTROOM_CONFIG") {
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/postroom/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    fn validate(&self) -> crate::Result<()> {
        if self.mail.domains.is_empty() {
            return Err(crate::Error::Config(
                "At least one mail domain is required".to_string(),
            ));
        }
        if self.matrix.homeserver.is_empty() {
            return Err(crate::Error::Config("Homeserver URL is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[matrix]
homeserver = "https://matrix.example.com"
access_token = "secret"

[mail]
domains = ["example.com", "example.org"]
admins = ["@admin:example.com"]
trusted_proxies = ["10.0.0.0/8"]
"#;

    #[test]
    fn test_default_config() {
        let smtp = SmtpConfig::default();
        assert_eq!(smtp.port, 25);
        assert_eq!(smtp.submission_port, 587);

        let dnsbl = DnsblConfig::default();
        assert!(dnsbl.enabled);
        assert_eq!(dnsbl.timeout_ms, 2000);
    }

    #[test]
    fn test_parse_config() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.mail.primary_domain(), "example.com");
        assert_eq!(config.matrix.prefix, "!pm");
        assert_eq!(config.database.backend, "postgres");
        assert!(config.mail.reserved.contains(&"postmaster".to_string()));
        assert!(config.dkim.is_none());
    }

    #[test]
    fn test_config_requires_domains() {
        let toml = r#"
[matrix]
homeserver = "https://matrix.example.com"
access_token = "secret"

[mail]
domains = []
"#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(crate::Error::Config(_))
        ));
    }
}
