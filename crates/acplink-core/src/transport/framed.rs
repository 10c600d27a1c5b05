//! Framed reader and writer halves over arbitrary byte streams

use super::codec::NdjsonCodec;
use super::{MessageReader, MessageWriter};
use crate::error::RpcError;
use crate::protocol::{Message, recoverable_request_id};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Longest `close` waits to flush buffered frames into a peer that stopped reading
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Reads NDJSON frames and classifies them into [`Message`]s
pub struct FramedReader<R> {
    framed: FramedRead<R, NdjsonCodec>,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            framed: FramedRead::new(reader, NdjsonCodec::with_max_line_bytes(max_line_bytes)),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageReader for FramedReader<R> {
    async fn receive(&mut self) -> Result<Option<Message>, RpcError> {
        loop {
            match self.framed.next().await {
                None => {
                    debug!("transport reader: EOF");
                    return Ok(None);
                }
                Some(Err(RpcError::Serialization { message })) => {
                    // Framing error; the codec resynchronises on the next newline.
                    warn!(error = %message, "transport reader: skipping bad frame");
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Message::parse(&line) {
                        Ok(message) => return Ok(Some(message)),
                        Err(error) => {
                            if let Some(id) = recoverable_request_id(&line) {
                                return Err(RpcError::InvalidRequest { id, error });
                            }
                            warn!(
                                code = error.code,
                                error = ?error.data,
                                "transport reader: skipping malformed message"
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Serialises [`Message`]s as single NDJSON lines
pub struct FramedWriter<W> {
    framed: FramedWrite<W, NdjsonCodec>,
    closed: bool,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            framed: FramedWrite::new(writer, NdjsonCodec::new()),
            closed: false,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageWriter for FramedWriter<W> {
    async fn send(&mut self, message: &Message) -> Result<(), RpcError> {
        if self.closed {
            return Err(RpcError::ConnectionClosed);
        }
        let line = serde_json::to_string(message)?;
        // `send` flushes, so each frame reaches the peer before the next one starts.
        self.framed.send(line).await
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.framed.close()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("transport writer: peer not draining, abandoning buffered frames");
                Err(RpcError::timeout(CLOSE_FLUSH_TIMEOUT))
            }
        }
    }
}
