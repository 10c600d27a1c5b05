//! Managed connection, reconnection and pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Managed connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedConfig {
    /// Upper bound on releasing owned resources during shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Automatic reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: default_shutdown_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ManagedConfig {
    /// Merge with another managed config (other takes precedence)
    pub fn merge(&mut self, other: ManagedConfig) {
        if other.shutdown_timeout != default_shutdown_timeout() && !other.shutdown_timeout.is_zero() {
            self.shutdown_timeout = other.shutdown_timeout;
        }
        self.reconnect.merge(other.reconnect);
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.2
}

/// Exponential backoff reconnection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Whether to reconnect after an unexpected disconnect
    #[serde(default)]
    pub enabled: bool,
    /// Attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Maximum jitter ratio (0.0 - 1.0)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl ReconnectConfig {
    /// Enabled policy with default tuning
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Set the retry budget
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial delay
    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Set the maximum delay
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter ratio
    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio;
        self
    }

    /// Merge with another reconnect config (other takes precedence)
    pub fn merge(&mut self, other: ReconnectConfig) {
        if other.enabled {
            self.enabled = true;
        }
        if other.max_retries != default_max_retries() {
            self.max_retries = other.max_retries;
        }
        if other.initial_delay != default_initial_delay() {
            self.initial_delay = other.initial_delay;
        }
        if other.max_delay != default_max_delay() {
            self.max_delay = other.max_delay;
        }
        if other.multiplier != default_multiplier() {
            self.multiplier = other.multiplier;
        }
        if other.jitter_ratio != default_jitter_ratio() {
            self.jitter_ratio = other.jitter_ratio;
        }
    }
}

fn default_max_size() -> usize {
    16
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of pooled connections
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
        }
    }
}

impl PoolConfig {
    pub fn merge(&mut self, other: PoolConfig) {
        if other.max_size != default_max_size() && other.max_size > 0 {
            self.max_size = other.max_size;
        }
    }
}
