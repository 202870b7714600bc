//! Configuration Module
//!
//! TOML configuration for the relaymq broker binary:
//! - Listener addresses
//! - Packet and queue limits
//! - Connect timeout and keep-alive tolerance
//! - Static username / password table
//! - Environment variable overrides (RELAYMQ__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::backend::{BackendLimits, Logins};
use crate::broker::BrokerConfig;
use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::session::DEFAULT_KEEP_ALIVE_TOLERANCE;
use crate::store::StoreKind;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Bad substitution pattern
    Pattern(regex::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Pattern(e) => write!(f, "Pattern error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<regex::Error> for ConfigError {
    fn from(e: regex::Error) -> Self {
        ConfigError::Pattern(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// WebSocket bind address (optional)
    pub ws_bind: Option<SocketAddr>,
    /// WebSocket path (default: "/mqtt")
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_bind: None,
            ws_path: default_ws_path(),
        }
    }
}

/// Size limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Per-connection outbound packet queue capacity
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Maximum queued messages per offline persistent session
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Longest a fan-out waits on a full outbound queue before closing
    /// that connection
    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub delivery_timeout: Duration,
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}
fn default_outbound_capacity() -> usize {
    1024
}
fn default_max_queued_messages() -> usize {
    1000
}
fn default_delivery_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
            outbound_capacity: default_outbound_capacity(),
            max_queued_messages: default_max_queued_messages(),
            delivery_timeout: default_delivery_timeout(),
        }
    }
}

/// Session timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time a new connection has to send CONNECT
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Silence tolerated, as a multiple of the client's keep-alive
    #[serde(default = "default_keep_alive_tolerance")]
    pub keep_alive_tolerance: f64,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_keep_alive_tolerance() -> f64 {
    DEFAULT_KEEP_ALIVE_TOLERANCE
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            keep_alive_tolerance: default_keep_alive_tolerance(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow connections without a username when auth is enabled
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

/// Message store configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreKind,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `RELAYMQ__SESSION__CONNECT_TIMEOUT=5s` overrides `session.connect_timeout`
    ///    - `RELAYMQ__AUTH__ENABLED=true` overrides `auth.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.ws_path", "/mqtt")?
            .set_default("session.connect_timeout", "10s")?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("store.backend", "memory")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "max_packet_size must be greater than 0".to_string(),
            ));
        }
        if self.limits.outbound_capacity == 0 {
            return Err(ConfigError::Validation(
                "outbound_capacity must be greater than 0".to_string(),
            ));
        }
        if self.limits.max_queued_messages == 0 {
            return Err(ConfigError::Validation(
                "max_queued_messages must be greater than 0".to_string(),
            ));
        }
        if self.limits.delivery_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "delivery_timeout must be greater than 0".to_string(),
            ));
        }

        if self.session.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }
        let tolerance = self.session.keep_alive_tolerance;
        if tolerance.is_nan() || tolerance < 1.0 {
            return Err(ConfigError::Validation(format!(
                "keep_alive_tolerance must be at least 1.0, got {}",
                tolerance
            )));
        }

        if self.auth.enabled {
            if self.auth.users.is_empty() && !self.auth.allow_anonymous {
                return Err(ConfigError::Validation(
                    "auth is enabled but no users are configured and anonymous access is disabled"
                        .to_string(),
                ));
            }
            for user in &self.auth.users {
                if user.username.is_empty() {
                    return Err(ConfigError::Validation(
                        "User with empty username".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Listener settings for [`crate::broker::Broker`]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            ws_bind_addr: self.server.ws_bind,
            ws_path: self.server.ws_path.clone(),
            max_packet_size: self.limits.max_packet_size,
            connect_timeout: self.session.connect_timeout,
            keep_alive_tolerance: self.session.keep_alive_tolerance,
            outbound_capacity: self.limits.outbound_capacity,
        }
    }

    /// Login table, or `None` when everyone is let in
    pub fn logins(&self) -> Option<Logins> {
        if !self.auth.enabled {
            return None;
        }

        let logins = self
            .auth
            .users
            .iter()
            .fold(Logins::new(), |logins, user| {
                logins.with_user(user.username.clone(), user.password.clone())
            });
        Some(logins.allow_anonymous(self.auth.allow_anonymous))
    }

    pub fn backend_limits(&self) -> BackendLimits {
        BackendLimits {
            max_queued_messages: self.limits.max_queued_messages,
            delivery_timeout: self.limits.delivery_timeout,
        }
    }
}
