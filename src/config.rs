//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides; the
//! variable names are shared with the platform's other adapters.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::broker::NatsConfig;
use crate::envelope::CodecLimits;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// WebSocket listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8180
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which broker implementation backs the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Nats,
    Memory,
}

impl BrokerKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "nats" => Some(BrokerKind::Nats),
            "memory" => Some(BrokerKind::Memory),
            _ => None,
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,

    #[serde(default = "default_broker_url")]
    pub url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_wait")]
    pub reconnect_wait_ms: u64,

    #[serde(default = "default_max_reconnect_wait")]
    pub max_reconnect_wait_ms: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Retries of a publish that failed with `BrokerUnavailable`
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_broker_kind() -> BrokerKind {
    BrokerKind::Nats
}

fn default_broker_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_reconnect_wait() -> u64 {
    500
}

fn default_max_reconnect_wait() -> u64 {
    10_000
}

fn default_ping_interval() -> u64 {
    30_000
}

fn default_publish_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    100
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            url: default_broker_url(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect_wait_ms: default_reconnect_wait(),
            max_reconnect_wait_ms: default_max_reconnect_wait(),
            ping_interval_ms: default_ping_interval(),
            publish_retries: default_publish_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl BrokerConfig {
    /// Settings for the NATS client
    pub fn nats(&self) -> NatsConfig {
        NatsConfig {
            url: self.url.clone(),
            name: "ws-adapter".to_string(),
            connect_timeout_ms: self.connect_timeout_ms,
            reconnect_wait_ms: self.reconnect_wait_ms,
            max_reconnect_wait_ms: self.max_reconnect_wait_ms,
            ping_interval_ms: self.ping_interval_ms,
        }
    }
}

/// Authorization authority configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Address of the things service
    #[serde(default = "default_auth_url")]
    pub url: String,

    /// Use TLS towards the authority
    #[serde(default)]
    pub client_tls: bool,

    /// Optional PEM bundle of trusted CAs
    #[serde(default)]
    pub ca_certs: String,

    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,
}

fn default_auth_url() -> String {
    "localhost:8181".to_string()
}

fn default_auth_timeout() -> u64 {
    5_000
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: default_auth_url(),
            client_tls: false,
            ca_certs: String::new(),
            timeout_ms: default_auth_timeout(),
        }
    }
}

/// Payload and per-connection limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,

    #[serde(default = "default_content_types")]
    pub content_types: Vec<String>,

    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_payload() -> usize {
    CodecLimits::default().max_payload_bytes
}

fn default_content_types() -> Vec<String> {
    CodecLimits::default().content_types
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_connections() -> usize {
    10_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload(),
            content_types: default_content_types(),
            outbound_queue_capacity: default_queue_capacity(),
            max_connections: default_max_connections(),
        }
    }
}

impl LimitsConfig {
    /// Limits enforced by the envelope codec
    pub fn codec(&self) -> CodecLimits {
        CodecLimits {
            max_payload_bytes: self.max_payload_bytes,
            content_types: self.content_types.clone(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("ws-adapter").join("config.toml")),
            Some(PathBuf::from("/etc/ws-adapter/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(port) = var("MF_WS_ADAPTER_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }

        // Broker overrides
        if let Some(url) = var("MF_NATS_URL") {
            self.broker.url = url;
        }
        if let Some(kind) = var("MF_WS_ADAPTER_BROKER").and_then(|k| BrokerKind::parse(&k)) {
            self.broker.kind = kind;
        }

        // Authorization overrides
        if let Some(url) = var("MF_THINGS_URL") {
            self.auth.url = url;
        }
        if let Some(tls) = var("MF_WS_ADAPTER_CLIENT_TLS") {
            self.auth.client_tls = tls.parse().unwrap_or(false);
        }
        if let Some(ca_certs) = var("MF_WS_ADAPTER_CA_CERTS") {
            self.auth.ca_certs = ca_certs;
        }

        // Limit overrides
        if let Some(max) = var("MF_WS_ADAPTER_MAX_PAYLOAD").and_then(|m| m.parse().ok()) {
            self.limits.max_payload_bytes = max;
        }
        if let Some(cap) = var("MF_WS_ADAPTER_QUEUE_CAPACITY").and_then(|c| c.parse().ok()) {
            self.limits.outbound_queue_capacity = cap;
        }

        // Logging overrides
        if let Some(level) = var("MF_WS_ADAPTER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("MF_WS_ADAPTER_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# ws-adapter Configuration
#
# Environment variables override these settings:
# - MF_WS_ADAPTER_PORT
# - MF_NATS_URL
# - MF_WS_ADAPTER_BROKER
# - MF_THINGS_URL
# - MF_WS_ADAPTER_CLIENT_TLS
# - MF_WS_ADAPTER_CA_CERTS
# - MF_WS_ADAPTER_MAX_PAYLOAD
# - MF_WS_ADAPTER_QUEUE_CAPACITY
# - MF_WS_ADAPTER_LOG_LEVEL
# - MF_WS_ADAPTER_LOG_FORMAT

[server]
# Listener host
host = "0.0.0.0"

# Listener port
port = 8180

[broker]
# Broker implementation: nats or memory (standalone, single process)
kind = "nats"

# NATS server URL
url = "nats://localhost:4222"

# Dial + handshake timeout (ms)
connect_timeout_ms = 5000

# Reconnect backoff, doubling from reconnect_wait_ms up to max_reconnect_wait_ms
reconnect_wait_ms = 500
max_reconnect_wait_ms = 10000

# Keepalive ping interval (ms)
ping_interval_ms = 30000

# Retries of a publish while the broker is unavailable
publish_retries = 2
retry_backoff_ms = 100

[auth]
# Things service address
url = "localhost:8181"

# Use TLS towards the things service
client_tls = false

# Optional CA bundle (PEM) trusted for TLS
ca_certs = ""

# Request timeout (ms)
timeout_ms = 5000

[limits]
# Maximum payload size (bytes)
max_payload_bytes = 262144

# Accepted payload content types (empty accepts any)
content_types = [
    "application/senml+json",
    "application/senml+cbor",
    "application/json",
    "text/plain",
    "application/octet-stream",
]

# Per-connection outbound queue; the oldest message is dropped when full
outbound_queue_capacity = 256

# Maximum concurrent WebSocket connections
max_connections = 10000

[logging]
# Log level: trace, debug, info, warn, error
level = "error"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
