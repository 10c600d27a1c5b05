//! Runtime configuration
//!
//! Every section has serde defaults, so a TOML file only needs the keys it
//! changes. Durations use humantime syntax (`"30s"`, `"250ms"`).
//!
//! ```toml
//! [connection]
//! name = "agent"
//! call_timeout = "2m"
//!
//! [managed.reconnect]
//! enabled = true
//! max_retries = 3
//! ```

mod connection_config;
mod logging_config;
mod managed_config;

pub use connection_config::{
    ConnectionConfig, DEFAULT_CALL_QUEUE_CAPACITY, DEFAULT_CALL_TIMEOUT_SECS,
    DEFAULT_INBOUND_BUFFER, DEFAULT_NOTIFICATION_BUFFER, StreamConfig,
};
pub use logging_config::{LOG_FORMATS, LOG_LEVELS, LoggingConfig};
pub use managed_config::{ManagedConfig, PoolConfig, ReconnectConfig};

use crate::error::{RpcError, RpcResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub managed: ManagedConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> RpcResult<Self> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> RpcResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RpcError::config(format!("failed to read config file '{}': {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "loading runtime config");
        Self::from_toml_str(&content)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> RpcResult<String> {
        toml::to_string_pretty(self).map_err(|e| RpcError::serialization(e.to_string()))
    }

    /// Check capacities and backoff parameters
    pub fn validate(&self) -> RpcResult<()> {
        let capacities = [
            ("connection.call_queue_capacity", self.connection.call_queue_capacity),
            ("connection.notification_buffer", self.connection.notification_buffer),
            ("connection.inbound_buffer", self.connection.inbound_buffer),
            ("connection.max_line_bytes", self.connection.max_line_bytes),
            ("stream.subscriber_capacity", self.stream.subscriber_capacity),
            ("pool.max_size", self.pool.max_size),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(RpcError::config(format!("{name} must be greater than zero")));
            }
        }

        if self.connection.call_timeout.is_zero() {
            return Err(RpcError::config("connection.call_timeout must be greater than zero"));
        }

        let reconnect = &self.managed.reconnect;
        if reconnect.multiplier.is_nan() || reconnect.multiplier < 1.0 {
            return Err(RpcError::config(format!(
                "managed.reconnect.multiplier must be at least 1.0, got {}",
                reconnect.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter_ratio) {
            return Err(RpcError::config(format!(
                "managed.reconnect.jitter_ratio must be within [0, 1], got {}",
                reconnect.jitter_ratio
            )));
        }
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(RpcError::config(
                "managed.reconnect.initial_delay must not exceed max_delay",
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(RpcError::config(format!(
                "Invalid log level '{}'. Valid levels are: {:?}",
                self.logging.level, LOG_LEVELS
            )));
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(RpcError::config(format!(
                "Invalid log format '{}'. Valid formats are: {:?}",
                self.logging.format, LOG_FORMATS
            )));
        }

        Ok(())
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: RuntimeConfig) {
        self.connection.merge(other.connection);
        self.stream.merge(other.stream);
        self.managed.merge(other.managed);
        self.pool.merge(other.pool);
        self.logging.merge(other.logging);
    }
}
