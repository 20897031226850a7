//! Server Configuration
//!
//! Everything is read from `CANVAS_*` environment variables; unset
//! variables keep their defaults, malformed ones are an error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::canvas::chat::ChatConfig;
use crate::canvas::limiter::{RateLimitConfig, RegenPolicy, MAX_COOLDOWN};
use crate::canvas::store::CanvasConfig;
use crate::persist::PersistConfig;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable is set but unusable.
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How often every connection is pinged.
    pub heartbeat_interval: Duration,
    /// Connections silent for this long are dropped.
    pub idle_timeout: Duration,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
    /// Whether unbound connections may chat.
    pub allow_anonymous_chat: bool,
    /// Server version string.
    pub version: String,
    /// Canvas dimensions.
    pub canvas: CanvasConfig,
    /// Points and cooldown.
    pub limits: RateLimitConfig,
    /// Chat retention and length.
    pub chat: ChatConfig,
    /// Snapshot and journal settings.
    pub persistence: PersistConfig,
    /// Newline-separated identity list to seed the account store.
    pub accounts_file: Option<PathBuf>,
    /// How often the accounts file is re-read for new identities.
    pub accounts_reload: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            outbound_queue: 256,
            allow_anonymous_chat: true,
            version: crate::VERSION.to_string(),
            canvas: CanvasConfig::default(),
            limits: RateLimitConfig::default(),
            chat: ChatConfig::default(),
            persistence: PersistConfig::default(),
            accounts_file: None,
            accounts_reload: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(addr) = env.parse("CANVAS_BIND")? {
            config.bind_addr = addr;
        }
        if let Some(max) = env.positive("CANVAS_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(secs) = env.positive("CANVAS_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env.positive("CANVAS_IDLE_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = env.positive("CANVAS_OUTBOUND_QUEUE")? {
            config.outbound_queue = capacity;
        }
        if let Some(allow) = env.flag("CANVAS_ANONYMOUS_CHAT")? {
            config.allow_anonymous_chat = allow;
        }

        if let Some(width) = env.positive("CANVAS_WIDTH")? {
            config.canvas.width = width;
        }
        if let Some(height) = env.positive("CANVAS_HEIGHT")? {
            config.canvas.height = height;
        }
        if let Some(size) = env.positive("CANVAS_CHUNK_SIZE")? {
            config.canvas.chunk_size = size;
        }

        if let Some(points) = env.positive("CANVAS_MAX_POINTS")? {
            config.limits.max_points = points;
        }
        if let Some(secs) = env.parse::<u64>("CANVAS_COOLDOWN_SECS")? {
            if secs > MAX_COOLDOWN.as_secs() {
                return Err(ConfigError::Invalid {
                    var: "CANVAS_COOLDOWN_SECS",
                    value: secs.to_string(),
                    reason: format!("must be at most {}", MAX_COOLDOWN.as_secs()),
                });
            }
            config.limits.cooldown = Duration::from_secs(secs);
        }
        if let Some(raw) = env.get("CANVAS_REGEN_POLICY") {
            config.limits.policy = match raw.trim().to_ascii_lowercase().as_str() {
                "full" | "full_refill" => RegenPolicy::FullRefill,
                "incremental" => RegenPolicy::Incremental,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "CANVAS_REGEN_POLICY",
                        value: raw,
                        reason: "expected `full` or `incremental`".to_string(),
                    })
                }
            };
        }

        if let Some(retention) = env.parse("CANVAS_CHAT_RETENTION")? {
            config.chat.retention = retention;
        }
        if let Some(max_len) = env.positive("CANVAS_CHAT_MAX_LEN")? {
            config.chat.max_len = max_len;
        }

        if let Some(dir) = env.get("CANVAS_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            config.persistence.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = env.positive("CANVAS_FLUSH_SECS")? {
            config.persistence.flush_interval = Duration::from_secs(secs);
        }
        if let Some(path) = env.get("CANVAS_ACCOUNTS_FILE").filter(|p| !p.trim().is_empty()) {
            config.accounts_file = Some(PathBuf::from(path));
        }
        if let Some(secs) = env.positive("CANVAS_ACCOUNTS_RELOAD_SECS")? {
            config.accounts_reload = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn positive<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr + Default + PartialEq,
        T::Err: std::fmt::Display,
    {
        match self.parse::<T>(var)? {
            Some(value) if value == T::default() => Err(ConfigError::Invalid {
                var,
                value: self.get(var).unwrap_or_default(),
                reason: "must be greater than zero".to_string(),
            }),
            other => Ok(other),
        }
    }

    fn flag(&self, var: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.get(var) {
            None => Ok(None),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }
}
