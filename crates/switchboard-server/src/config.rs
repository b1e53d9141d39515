//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use switchboard_types::{DEFAULT_HEARTBEAT_TTL_SECS, DEFAULT_MESSAGE_TTL_SECS};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Perimeter secrets. All three absent means dev mode: auth disabled.
    #[serde(default)]
    pub auth: AuthSection,

    /// Lifecycle timing knobs.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Trust `X-Forwarded-For` / `X-Real-IP` for client addresses.
    #[serde(default)]
    pub behind_proxy: bool,
}

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: String,
}

/// Perimeter secrets shared with the fronting proxy and administrators.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    pub server_secret: Option<String>,
    pub admin_key: Option<String>,
    pub proxy_token: Option<String>,
}

/// Lifecycle timing knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Seconds of heartbeat silence before an agent reads as offline.
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: i64,

    /// Seconds a queued message survives without acknowledgment.
    #[serde(default = "default_message_ttl")]
    pub message_ttl_secs: i64,

    /// Seconds between scavenger sweeps.
    #[serde(default = "default_scavenge_interval")]
    pub scavenge_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "switchboard_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8420
}

fn default_store_path() -> String {
    "switchboard.db".to_string()
}

fn default_heartbeat_ttl() -> i64 {
    DEFAULT_HEARTBEAT_TTL_SECS
}

fn default_message_ttl() -> i64 {
    DEFAULT_MESSAGE_TTL_SECS
}

fn default_scavenge_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            behind_proxy: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: default_heartbeat_ttl(),
            message_ttl_secs: default_message_ttl(),
            scavenge_interval_secs: default_scavenge_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `STORE_URL` overrides `store.path`
/// - `PORT` overrides `server.port`
/// - `BIND_HOST` overrides `server.host`
/// - `BEHIND_PROXY` overrides `server.behind_proxy` ("1"/"true" to enable)
/// - `SERVER_SECRET`, `ADMIN_KEY`, `PROXY_BEARER_TOKEN` override `auth.*`
/// - `HEARTBEAT_TTL`, `MESSAGE_TTL` override `lifecycle.*` (seconds)
/// - `LOG_LEVEL`, `LOG_JSON` override `logging.*`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(store_url) = std::env::var("STORE_URL") {
        config.store.path = store_url;
    }
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(host) = std::env::var("BIND_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(flag) = std::env::var("BEHIND_PROXY") {
        config.server.behind_proxy = matches!(flag.as_str(), "1" | "true" | "yes");
    }
    if let Ok(secret) = std::env::var("SERVER_SECRET") {
        config.auth.server_secret = Some(secret);
    }
    if let Ok(key) = std::env::var("ADMIN_KEY") {
        config.auth.admin_key = Some(key);
    }
    if let Ok(token) = std::env::var("PROXY_BEARER_TOKEN") {
        config.auth.proxy_token = Some(token);
    }
    if let Ok(ttl) = std::env::var("HEARTBEAT_TTL") {
        if let Ok(parsed) = ttl.parse() {
            config.lifecycle.heartbeat_ttl_secs = parsed;
        }
    }
    if let Ok(ttl) = std::env::var("MESSAGE_TTL") {
        if let Ok(parsed) = ttl.parse() {
            config.lifecycle.message_ttl_secs = parsed;
        }
    }
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
