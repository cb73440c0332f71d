//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `wamp` binary)
//!
//! ```toml
//! [client]
//! endpoint = "ws://127.0.0.1:8080/ws"
//! realm = "realm1"
//! format = "json"
//! request_timeout_ms = 30000
//!
//! [client.reconnect]
//! max_attempts = 8
//! delay = { kind = "fixed", delay_ms = 60000 }
//!
//! [logging]
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WampError};
use crate::protocol::{UriPolicy, DEFAULT_AGENT};
use crate::session::ReconnectPolicy;
use crate::transport::Format;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WampError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| WampError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location (`<config dir>/wamp/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("wamp").join("config.toml"))
    }

    /// Load the default config file if it exists
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("WAMP_ENDPOINT") {
            config.client.endpoint = endpoint;
        }
        if let Ok(realm) = std::env::var("WAMP_REALM") {
            config.client.realm = realm;
        }
        if let Ok(format) = std::env::var("WAMP_FORMAT") {
            if let Ok(format) = format.parse() {
                config.client.format = format;
            }
        }
        if let Ok(attempts) = std::env::var("WAMP_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                config.client.reconnect.max_attempts = attempts;
            }
        }
        if let Ok(level) = std::env::var("WAMP_LOG_LEVEL") {
            config.logging.level = level;
        }

        config
    }

    /// Merge with another config (other takes precedence where it differs
    /// from the defaults)
    pub fn merge(self, other: Self) -> Self {
        fn pick<T: PartialEq>(base: T, over: T, default: &T) -> T {
            if over == *default {
                base
            } else {
                over
            }
        }

        let client_defaults = ClientConfig::default();
        let logging_defaults = LoggingConfig::default();

        Self {
            client: ClientConfig {
                endpoint: pick(self.client.endpoint, other.client.endpoint, &client_defaults.endpoint),
                realm: pick(self.client.realm, other.client.realm, &client_defaults.realm),
                format: pick(self.client.format, other.client.format, &client_defaults.format),
                agent: pick(self.client.agent, other.client.agent, &client_defaults.agent),
                uri_policy: pick(
                    self.client.uri_policy,
                    other.client.uri_policy,
                    &client_defaults.uri_policy,
                ),
                connect_timeout_ms: pick(
                    self.client.connect_timeout_ms,
                    other.client.connect_timeout_ms,
                    &client_defaults.connect_timeout_ms,
                ),
                request_timeout_ms: pick(
                    self.client.request_timeout_ms,
                    other.client.request_timeout_ms,
                    &client_defaults.request_timeout_ms,
                ),
                close_timeout_ms: pick(
                    self.client.close_timeout_ms,
                    other.client.close_timeout_ms,
                    &client_defaults.close_timeout_ms,
                ),
                reconnect: pick(
                    self.client.reconnect,
                    other.client.reconnect,
                    &client_defaults.reconnect,
                ),
            },
            logging: LoggingConfig {
                level: pick(self.logging.level, other.logging.level, &logging_defaults.level),
                json: self.logging.json || other.logging.json,
            },
        }
    }
}

/// Client connection and session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Router endpoint (`ws://`, `wss://`, `tcp://`, `rs://`)
    pub endpoint: String,

    /// Realm to join
    pub realm: String,

    /// Serialization format
    pub format: Format,

    /// Agent string sent in HELLO
    pub agent: String,

    /// URI validation rule
    pub uri_policy: UriPolicy,

    /// Timeout for one connection attempt
    pub connect_timeout_ms: u64,

    /// Timeout for correlated requests (none by default)
    pub request_timeout_ms: Option<u64>,

    /// How long to wait for the router's GOODBYE reply
    pub close_timeout_ms: u64,

    /// Reconnection policy
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080/ws".to_string(),
            realm: "default".to_string(),
            format: Format::Json,
            agent: DEFAULT_AGENT.to_string(),
            uri_policy: UriPolicy::Loose,
            connect_timeout_ms: 10_000,
            request_timeout_ms: None,
            close_timeout_ms: 5_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Use a reconnection policy
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Use a request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Use a close timeout
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Use a URI policy
    pub fn with_uri_policy(mut self, policy: UriPolicy) -> Self {
        self.uri_policy = policy;
        self
    }

    /// Connection attempt timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Correlated request timeout
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// GOODBYE reply timeout
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
