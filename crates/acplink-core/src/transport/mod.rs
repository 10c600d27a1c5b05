//! Transport layer
//!
//! A transport is a duplex byte stream carrying newline-delimited JSON-RPC
//! frames. It is split into a reader half and a writer half so that the
//! connection's read task and its outbound tasks never contend for the same
//! object.
//!
//! ## Available bindings
//!
//! - **Streams**: any `AsyncRead`/`AsyncWrite` pair ([`Transport::from_streams`])
//! - **Stdio**: the current process's stdin/stdout ([`Transport::stdio`])
//! - **Subprocess**: a spawned child's stdin/stdout ([`Transport::spawn`])
//! - **Memory**: a looped-back pair for tests ([`memory::pair`])

pub mod codec;
pub mod framed;
pub mod memory;
pub mod stdio;

pub use codec::{DEFAULT_MAX_LINE_BYTES, NdjsonCodec};
pub use framed::{CLOSE_FLUSH_TIMEOUT, FramedReader, FramedWriter};
pub use stdio::ChildWriter;

use crate::error::RpcError;
use crate::protocol::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};

/// Read side of a transport
#[async_trait]
pub trait MessageReader: Send {
    /// Receive the next message; `Ok(None)` means the peer closed the stream.
    ///
    /// [`RpcError::InvalidRequest`] reports a malformed request whose id
    /// could still be read. It is not fatal: the read side stays usable.
    async fn receive(&mut self) -> Result<Option<Message>, RpcError>;
}

/// Write side of a transport
#[async_trait]
pub trait MessageWriter: Send {
    /// Write one complete message
    async fn send(&mut self, message: &Message) -> Result<(), RpcError>;

    /// Flush and close the write side; closing twice is a no-op
    async fn close(&mut self) -> Result<(), RpcError>;
}

/// A bound transport: one reader half and one writer half
pub struct Transport {
    reader: Box<dyn MessageReader>,
    writer: Box<dyn MessageWriter>,
}

impl Transport {
    /// Assemble a transport from existing halves
    pub fn new(reader: Box<dyn MessageReader>, writer: Box<dyn MessageWriter>) -> Self {
        Self { reader, writer }
    }

    /// Frame an arbitrary byte stream pair
    pub fn from_streams<R, W>(reader: R, writer: W, max_line_bytes: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            Box::new(FramedReader::new(reader, max_line_bytes)),
            Box::new(FramedWriter::new(writer)),
        )
    }

    /// Open a transport described by configuration
    pub fn open(config: &TransportConfig, max_line_bytes: usize) -> Result<Self, RpcError> {
        match config {
            TransportConfig::Stdio => Ok(Self::stdio(max_line_bytes)),
            TransportConfig::Process { command, args, env } => {
                Self::spawn_with_env(command, args, env, max_line_bytes)
            }
        }
    }

    /// Split into the reader and writer halves
    pub fn into_parts(self) -> (Box<dyn MessageReader>, Box<dyn MessageWriter>) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    /// This process's own stdin/stdout (the agent side of a subprocess pair)
    Stdio,
    /// Spawn a subprocess and talk over its stdin/stdout
    Process {
        /// Command to spawn
        command: String,
        /// Command arguments
        args: Vec<String>,
        /// Environment variables
        env: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// Create a subprocess transport config
    pub fn process(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::Process {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }
}
