//! Runtime error type

use super::protocol_error::ProtocolError;
use crate::protocol::RequestId;
use crate::state::ConnectionState;
use thiserror::Error;

/// Result type alias for acplink operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors produced by the connection engine.
///
/// `Clone` so a single close outcome can be handed to every concurrent
/// caller of [`Connection::close`](crate::connection::Connection::close).
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    /// The connection was closed locally
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer went away while the connection was in use
    #[error("Disconnected: {reason}")]
    Disconnected { reason: String },

    /// Transport I/O failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The peer answered with a JSON-RPC error
    #[error("Protocol error {0}")]
    Protocol(ProtocolError),

    /// The peer sent a request that could not be decoded; `id` is answerable
    #[error("Invalid request {id}: {error}")]
    InvalidRequest { id: RequestId, error: ProtocolError },

    /// The outbound notification buffer is full
    #[error("Notification queue full (capacity {capacity})")]
    NotificationQueueFull { capacity: usize },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation exceeded its deadline
    #[error("Request timeout after {millis} ms")]
    Timeout { millis: u64 },

    /// A state change outside the transition table was requested
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// The pool has no room for another connection
    #[error("Connection pool full (max {capacity})")]
    PoolFull { capacity: usize },

    /// The pool already holds a connection under this id
    #[error("Connection already exists: {id}")]
    DuplicateConnection { id: String },

    /// Encoding or decoding failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Several independent steps failed
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<RpcError>),

    /// Anything else
    #[error("{message}")]
    Other { message: String },
}

/// Coarse classification used by retry logic and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Backpressure,
    Cancellation,
    InvalidState,
    Pool,
    Serialization,
    Config,
    Aggregate,
    Other,
}

fn join_errors(errors: &[RpcError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RpcError {
    /// Create a new Disconnected error
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Create a new Transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new Other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Create a Timeout error from a duration
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout {
            millis: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Bundle collected errors; `None` when nothing failed
    pub fn aggregate(errors: Vec<RpcError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self::Aggregate(errors))
        }
    }

    /// The individual failures behind this error
    pub fn causes(&self) -> &[RpcError] {
        match self {
            Self::Aggregate(errors) => errors,
            other => std::slice::from_ref(other),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionClosed | Self::Disconnected { .. } | Self::Transport { .. } => {
                ErrorKind::Transport
            }
            Self::Protocol(_) | Self::InvalidRequest { .. } => ErrorKind::Protocol,
            Self::NotificationQueueFull { .. } => ErrorKind::Backpressure,
            Self::Cancelled | Self::Timeout { .. } => ErrorKind::Cancellation,
            Self::InvalidTransition { .. } => ErrorKind::InvalidState,
            Self::PoolFull { .. } | Self::DuplicateConnection { .. } => ErrorKind::Pool,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::Config { .. } => ErrorKind::Config,
            Self::Aggregate(_) => ErrorKind::Aggregate,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Whether the failure originated in the transport layer
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// The wire error, if the peer answered with one
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(e) | Self::InvalidRequest { error: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Check if this error is retryable by a reconnecting caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Disconnected { .. }
                | Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::NotificationQueueFull { .. }
        )
    }
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<toml::de::Error> for RpcError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("invalid config: {}", err))
    }
}
