//! Connection and stream configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-call response timeout (5 minutes)
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 300;
/// Default outbound call queue depth
pub const DEFAULT_CALL_QUEUE_CAPACITY: usize = 100;
/// Default outbound notification buffer
pub const DEFAULT_NOTIFICATION_BUFFER: usize = 50;
/// Default inbound dispatch queue depth
pub const DEFAULT_INBOUND_BUFFER: usize = 100;

fn default_call_timeout() -> Duration {
    Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)
}

fn default_call_queue_capacity() -> usize {
    DEFAULT_CALL_QUEUE_CAPACITY
}

fn default_notification_buffer() -> usize {
    DEFAULT_NOTIFICATION_BUFFER
}

fn default_inbound_buffer() -> usize {
    DEFAULT_INBOUND_BUFFER
}

fn default_max_line_bytes() -> usize {
    crate::transport::DEFAULT_MAX_LINE_BYTES
}

fn default_name() -> String {
    "acplink".to_string()
}

/// Per-connection tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Name used in log fields
    #[serde(default = "default_name")]
    pub name: String,
    /// How long `call` waits for a response
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Queued outbound calls before `call` waits for room
    #[serde(default = "default_call_queue_capacity")]
    pub call_queue_capacity: usize,
    /// Queued outbound notifications before `notify` rejects
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
    /// Inbound requests/notifications awaiting dispatch
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
    /// Longest accepted NDJSON line
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            call_timeout: default_call_timeout(),
            call_queue_capacity: default_call_queue_capacity(),
            notification_buffer: default_notification_buffer(),
            inbound_buffer: default_inbound_buffer(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl ConnectionConfig {
    /// Same settings under another name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Merge with another connection config (other takes precedence)
    pub fn merge(&mut self, other: ConnectionConfig) {
        if !other.name.is_empty() && other.name != default_name() {
            self.name = other.name;
        }
        if other.call_timeout != default_call_timeout() && !other.call_timeout.is_zero() {
            self.call_timeout = other.call_timeout;
        }
        if other.call_queue_capacity != DEFAULT_CALL_QUEUE_CAPACITY && other.call_queue_capacity > 0 {
            self.call_queue_capacity = other.call_queue_capacity;
        }
        if other.notification_buffer != DEFAULT_NOTIFICATION_BUFFER && other.notification_buffer > 0 {
            self.notification_buffer = other.notification_buffer;
        }
        if other.inbound_buffer != DEFAULT_INBOUND_BUFFER && other.inbound_buffer > 0 {
            self.inbound_buffer = other.inbound_buffer;
        }
        if other.max_line_bytes != default_max_line_bytes() && other.max_line_bytes > 0 {
            self.max_line_bytes = other.max_line_bytes;
        }
    }
}

fn default_subscriber_capacity() -> usize {
    crate::stream::DEFAULT_SUBSCRIBER_CAPACITY
}

/// Stream broadcast configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Messages buffered per subscriber before drops begin
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl StreamConfig {
    pub fn merge(&mut self, other: StreamConfig) {
        if other.subscriber_capacity != default_subscriber_capacity() && other.subscriber_capacity > 0 {
            self.subscriber_capacity = other.subscriber_capacity;
        }
    }
}
