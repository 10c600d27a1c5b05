//! Lossy fan-out of wire events to independent subscribers

use super::message::StreamMessage;
use crate::error::RpcError;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default per-subscriber queue capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Why [`Subscriber::recv`] returned without a message
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The broadcast closed, or the subscriber unsubscribed, and the queue is drained
    #[error("Stream subscription closed")]
    Closed,
    /// The caller's token fired first
    #[error("Stream receive cancelled")]
    Cancelled,
}

impl From<StreamError> for RpcError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Closed => RpcError::ConnectionClosed,
            StreamError::Cancelled => RpcError::Cancelled,
        }
    }
}

struct Slot {
    id: u64,
    tx: mpsc::Sender<StreamMessage>,
}

struct Shared {
    slots: RwLock<Vec<Slot>>,
    capacity: usize,
    done: CancellationToken,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn remove(&self, id: u64) {
        self.slots.write().retain(|slot| slot.id != id);
    }
}

/// Publish/subscribe hub for [`StreamMessage`]s.
///
/// Delivery is at-most-once and never blocks the publisher: each subscriber
/// owns a bounded queue, and a message that does not fit is dropped for that
/// subscriber alone.
#[derive(Clone)]
pub struct StreamBroadcast {
    shared: Arc<Shared>,
}

impl StreamBroadcast {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a broadcast whose subscribers buffer `capacity` messages each
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: RwLock::new(Vec::new()),
                capacity: capacity.max(1),
                done: CancellationToken::new(),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new subscriber.
    ///
    /// After [`close`](Self::close) the returned subscriber is already closed.
    pub fn subscribe(&self) -> Subscriber {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.capacity);

        {
            let mut slots = self.shared.slots.write();
            // Checked under the lock so a concurrent close cannot miss this slot.
            if !self.shared.done.is_cancelled() {
                slots.push(Slot { id, tx });
            }
        }

        Subscriber {
            id,
            rx,
            done: self.shared.done.clone(),
            owner: Arc::downgrade(&self.shared),
        }
    }

    /// Offer `message` to every subscriber without waiting
    pub fn broadcast(&self, message: StreamMessage) {
        if self.shared.done.is_cancelled() {
            return;
        }

        let mut stale = false;
        {
            let slots = self.shared.slots.read();
            for slot in slots.iter() {
                match slot.tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(subscriber = slot.id, "stream subscriber full, message dropped");
                    }
                    Err(TrySendError::Closed(_)) => stale = true,
                }
            }
        }

        if stale {
            self.shared.slots.write().retain(|slot| !slot.tx.is_closed());
        }
    }

    /// Close the broadcast and every subscriber queue; idempotent
    pub fn close(&self) {
        let mut slots = self.shared.slots.write();
        if self.shared.done.is_cancelled() {
            return;
        }
        self.shared.done.cancel();
        // Dropping the senders closes each queue once it is drained.
        slots.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.done.is_cancelled()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.shared.slots.read().len()
    }

    /// Messages dropped across all subscribers because their queue was full
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Default for StreamBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamBroadcast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBroadcast")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One observer's bounded view of the broadcast
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<StreamMessage>,
    done: CancellationToken,
    owner: Weak<Shared>,
}

impl Subscriber {
    /// Wait for the next message
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Result<StreamMessage, StreamError> {
        tokio::select! {
            biased;
            message = self.rx.recv() => message.ok_or(StreamError::Closed),
            _ = cancel.cancelled() => Err(StreamError::Cancelled),
        }
    }

    /// Take a buffered message if there is one
    pub fn try_recv(&mut self) -> Option<StreamMessage> {
        self.rx.try_recv().ok()
    }

    /// Whether the owning broadcast has been closed
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled() || self.owner.strong_count() == 0
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving and release the queue
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
