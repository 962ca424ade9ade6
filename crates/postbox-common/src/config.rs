//! Configuration for Postbox

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// LMTP listener and protocol configuration
    #[serde(default)]
    pub lmtp: LmtpConfig,

    /// Message-ID dedupe cache configuration
    #[serde(default)]
    pub dedupe: DedupeConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Database configuration (SQL account directory)
    pub database: Option<DatabaseConfig>,

    /// HTTP ingress configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// TLS configuration
    pub tls: Option<TlsConfig>,

    /// Post-delivery webhook callbacks
    #[serde(default)]
    pub callbacks: CallbacksConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in banners
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Name of this node; accounts homed elsewhere are delivered remotely
    #[serde(default = "default_hostname")]
    pub node_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            node_name: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// LMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmtpConfig {
    /// Bind host
    #[serde(default = "default_lmtp_host")]
    pub host: String,

    /// Port for the event-driven listener
    #[serde(default = "default_lmtp_port")]
    pub port: u16,

    /// Port for the thread-per-connection listener, disabled when unset
    pub blocking_port: Option<u16>,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum recipients per transaction
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Character separating the addressing tag from the local part
    pub recipient_delimiter: Option<char>,

    /// Offer STARTTLS when a certificate is configured
    #[serde(default = "default_true")]
    pub starttls: bool,

    /// Refuse MAIL until STARTTLS has completed
    #[serde(default)]
    pub tls_required: bool,

    /// Refuse transaction commands until LHLO has been issued
    #[serde(default = "default_true")]
    pub lhlo_required: bool,

    /// Answer over-quota deliveries with a permanent failure
    #[serde(default)]
    pub permanent_failure_when_over_quota: bool,

    /// Reject messages with lines longer than `max_line_length`
    #[serde(default)]
    pub validate_messages: bool,

    /// Longest accepted line when validation is on
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// How long a delivery waits for another delivery to the same mailbox
    #[serde(default = "default_lock_timeout")]
    pub mailbox_lock_timeout_secs: u64,

    /// LMTP port of remote nodes
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,

    /// Remote connect timeout in seconds
    #[serde(default = "default_remote_connect_timeout")]
    pub remote_connect_timeout_secs: u64,

    /// Remote read timeout in seconds
    #[serde(default = "default_remote_read_timeout")]
    pub remote_read_timeout_secs: u64,
}

impl Default for LmtpConfig {
    fn default() -> Self {
        Self {
            host: default_lmtp_host(),
            port: default_lmtp_port(),
            blocking_port: None,
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            recipient_delimiter: None,
            starttls: true,
            tls_required: false,
            lhlo_required: true,
            permanent_failure_when_over_quota: false,
            validate_messages: false,
            max_line_length: default_max_line_length(),
            mailbox_lock_timeout_secs: default_lock_timeout(),
            remote_port: default_remote_port(),
            remote_connect_timeout_secs: default_remote_connect_timeout(),
            remote_read_timeout_secs: default_remote_read_timeout(),
        }
    }
}

fn default_lmtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_lmtp_port() -> u16 {
    7025
}

fn default_max_connections() -> usize {
    100
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024 // 25 MB
}

fn default_max_recipients() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_max_line_length() -> usize {
    10240
}

fn default_lock_timeout() -> u64 {
    60
}

fn default_remote_port() -> u16 {
    7025
}

fn default_remote_connect_timeout() -> u64 {
    30
}

fn default_remote_read_timeout() -> u64 {
    300
}

/// Message-ID dedupe cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeConfig {
    /// Number of message ids kept when no timeout is set
    #[serde(default = "default_dedupe_cache_size")]
    pub cache_size: usize,

    /// Entry lifetime in milliseconds; zero selects size-bounded eviction
    #[serde(default)]
    pub entry_timeout_ms: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            cache_size: default_dedupe_cache_size(),
            entry_timeout_ms: 0,
        }
    }
}

fn default_dedupe_cache_size() -> usize {
    3000
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend: "fs"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Base path for staged incoming blobs
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Mailbox backend: "memory" (lost on restart)
    #[serde(default = "default_mailbox_backend")]
    pub mailbox_backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
            mailbox_backend: default_mailbox_backend(),
        }
    }
}

fn default_mailbox_backend() -> String {
    "memory".to_string()
}

fn default_storage_backend() -> String {
    "fs".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/postbox/blobs")
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_db_min_connections")]
    pub min_connections: u32,
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_db_min_connections() -> u32 {
    2
}

/// HTTP ingress configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the HTTP ingress
    #[serde(default)]
    pub enabled: bool,

    /// Bind address
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_api_bind(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:7073".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_path: PathBuf,

    /// Path to private key file
    pub key_path: PathBuf,
}

/// Post-delivery callback configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbacksConfig {
    /// Webhooks notified after every local delivery
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

/// A single webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Target URL
    pub url: String,

    /// Secret for the HMAC-SHA256 signature header
    pub secret: Option<String>,

    /// Request timeout in milliseconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_ms: u64,

    /// Permit loopback and private network targets
    #[serde(default)]
    pub allow_private_targets: bool,
}

fn default_webhook_timeout() -> u64 {
    5000
}

impl Config {
    /// Load configuration from a file, with `POSTBOX__SECTION__KEY`
    /// environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("POSTBOX").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./postbox.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/postbox/postbox.toml"),
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
}
