//! Shared write side of a connection

use super::stats::StatsCounters;
use crate::error::{RpcError, RpcResult};
use crate::protocol::Message;
use crate::stream::{Direction, StreamBroadcast, StreamMessage};
use crate::transport::MessageWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Upper bound on closing the writer, covering a subprocess's exit grace period
pub(crate) const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// The single writer every outbound path goes through.
///
/// The async mutex keeps frames whole: one message is written completely
/// before the next writer gets the transport.
pub(crate) struct Wire {
    writer: Mutex<Box<dyn MessageWriter>>,
    stream: StreamBroadcast,
    stats: Arc<StatsCounters>,
}

impl Wire {
    pub(crate) fn new(
        writer: Box<dyn MessageWriter>,
        stream: StreamBroadcast,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            writer: Mutex::new(writer),
            stream,
            stats,
        }
    }

    /// Write one message and publish it to stream subscribers
    pub(crate) async fn write(&self, message: Message) -> RpcResult<()> {
        let mut writer = self.writer.lock().await;
        writer.send(&message).await?;
        self.stats.record_outgoing(&message);
        self.stream
            .broadcast(StreamMessage::new(Direction::Outgoing, &message));
        Ok(())
    }

    /// Close the writer.
    ///
    /// Every other writer selects on the shutdown token, so the lock is
    /// free soon after shutdown; the timeout guards writers that never
    /// finish closing.
    pub(crate) async fn close(&self) -> RpcResult<()> {
        let close = async { self.writer.lock().await.close().await };
        match tokio::time::timeout(WRITER_CLOSE_TIMEOUT, close).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::timeout(WRITER_CLOSE_TIMEOUT)),
        }
    }
}
