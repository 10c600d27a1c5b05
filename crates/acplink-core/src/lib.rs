//! acplink core library
//!
//! This crate provides the connection engine for agent/client protocols:
//! bidirectional JSON-RPC 2.0 over newline-delimited JSON, with handler
//! dispatch, ordered outbound call and notification queues, a lifecycle
//! state machine, an observability stream of wire traffic, and managed
//! connections with pooling and reconnection.
//!
//! ```no_run
//! use acplink_core::{Connection, ProtocolError, Transport};
//!
//! # async fn demo() -> acplink_core::RpcResult<()> {
//! let transport = Transport::spawn("my-agent", &["--stdio"], 1 << 20)?;
//! let conn = Connection::builder(transport)
//!     .method("fs/read_text_file", |_conn, path: String| async move {
//!         std::fs::read_to_string(&path).map_err(|_| ProtocolError::not_found())
//!     })
//!     .start();
//!
//! let reply: serde_json::Value = conn.call("initialize", serde_json::json!({})).await?;
//! conn.close().await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod managed;
pub mod protocol;
pub mod state;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use config::{ConnectionConfig, LoggingConfig, ManagedConfig, ReconnectConfig, RuntimeConfig};
pub use connection::{Connection, ConnectionBuilder, ConnectionStats};
pub use error::{ErrorKind, ProtocolError, RpcError, RpcResult, codes};
pub use handler::{HandlerRegistry, InboundMessage};
pub use managed::{
    ConnectionEvent, ConnectionPool, Connector, ManagedConnection, ManagedResource,
    ReconnectPolicy, Role, ShutdownState,
};
pub use protocol::{Message, Notification, Request, RequestId, Response};
pub use state::{ConnectionState, StateMachine};
pub use stream::{Direction, StreamBroadcast, StreamError, StreamMessage, StreamPayload, Subscriber};
pub use transport::{Transport, TransportConfig};
