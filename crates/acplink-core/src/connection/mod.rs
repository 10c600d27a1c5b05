//! Connection core
//!
//! A [`Connection`] turns a [`Transport`](crate::transport::Transport) into
//! a bidirectional JSON-RPC channel. Four tasks run per connection:
//!
//! - the read loop routes responses to waiting callers and forwards requests
//!   and notifications to dispatch;
//! - the dispatch loop runs handlers one message at a time and writes their
//!   responses;
//! - the call consumer writes queued calls in FIFO order;
//! - the notification consumer writes buffered notifications.
//!
//! Handlers receive the `Connection` itself and may call back into the peer
//! from inside a handler: responses are routed by the read loop, never by
//! the dispatch loop, so such re-entrant calls cannot deadlock.

mod builder;
mod pending;
mod queue;
mod reader;
mod stats;
mod wire;

#[cfg(test)]
mod tests;

pub use builder::ConnectionBuilder;
pub use stats::ConnectionStats;

use crate::config::ConnectionConfig;
use crate::error::{RpcError, RpcResult};
use crate::handler::HandlerRegistry;
use crate::protocol::{Notification, RequestId, encode_params};
use crate::state::{ConnectionState, StateMachine};
use crate::stream::{StreamBroadcast, Subscriber};
use crate::transport::Transport;
use parking_lot::Mutex;
use pending::PendingCalls;
use queue::{QueuedCall, QueuedNotification};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use stats::StatsCounters;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use wire::Wire;

/// Open/closed bookkeeping shared with the read loop
#[derive(Default)]
pub(crate) struct Liveness {
    closed: AtomicBool,
    done: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl Liveness {
    fn mark_disconnected(&self, reason: String) {
        self.reason.lock().get_or_insert(reason);
    }

    /// The error a caller gets once the connection is unusable
    fn terminal_error(&self) -> Option<RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Some(RpcError::ConnectionClosed);
        }
        if self.done.is_cancelled() {
            let reason = self
                .reason
                .lock()
                .clone()
                .unwrap_or_else(|| "connection lost".to_string());
            return Some(RpcError::disconnected(reason));
        }
        None
    }
}

pub(crate) struct Inner {
    id: Uuid,
    name: String,
    config: ConnectionConfig,
    registry: Arc<HandlerRegistry>,
    wire: Arc<Wire>,
    pending: Arc<PendingCalls>,
    stream: StreamBroadcast,
    stats: Arc<StatsCounters>,
    state: StateMachine,
    liveness: Arc<Liveness>,
    shutdown: CancellationToken,
    call_tx: mpsc::Sender<QueuedCall>,
    notify_tx: mpsc::Sender<QueuedNotification>,
    next_id: AtomicI64,
    close_outcome: OnceCell<RpcResult<()>>,
}

impl Inner {
    async fn close_once(&self) -> RpcResult<()> {
        self.liveness.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.pending.fail_all(&RpcError::ConnectionClosed);

        let result = self.wire.close().await;
        if let Err(e) = &result {
            warn!(connection = %self.name, error = %e, "transport close failed");
        }

        self.stream.close();
        self.liveness.done.cancel();
        info!(connection = %self.name, id = %self.id, "connection closed");
        result
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to one running JSON-RPC connection.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Start configuring a connection over `transport`
    pub fn builder(transport: Transport) -> ConnectionBuilder {
        ConnectionBuilder::new(transport)
    }

    /// Unique identity of this connection instance
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Methods this side answers
    pub fn methods(&self) -> Vec<String> {
        self.inner.registry.methods()
    }

    /// Call `method` and decode the result, with the default timeout
    pub async fn call<P, R>(&self, method: &str, params: P) -> RpcResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_with(&CancellationToken::new(), method, params).await
    }

    /// Call `method`, giving up when `cancel` fires
    pub async fn call_with<P, R>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
    ) -> RpcResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(cancel, method, params, self.inner.config.call_timeout)
            .await
    }

    /// Call `method` with an explicit response timeout
    pub async fn call_with_timeout<P, R>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> RpcResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = encode_params(&params)?;
        let value = self.call_raw(cancel, method, params, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call with raw JSON params and result.
    ///
    /// The request is queued behind earlier calls and written in order.
    /// Cancelling before it is written means it is never sent; cancelling
    /// afterwards only stops the local wait.
    #[instrument(skip(self, cancel, params), fields(connection = %self.inner.name), level = "debug")]
    pub async fn call_raw(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> RpcResult<Value> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (result_tx, result_rx) = oneshot::channel();
        // Dropping the slot on any exit path forgets the call.
        let _slot = self.inner.pending.register(id.clone(), result_tx);
        let queued = QueuedCall {
            id: id.clone(),
            method: method.to_string(),
            params,
            cancel: cancel.clone(),
        };

        let done = &self.inner.liveness.done;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            _ = done.cancelled() => return Err(self.terminal_error()),
            _ = &mut deadline => return Err(RpcError::timeout(timeout)),
            sent = self.inner.call_tx.send(queued) => {
                sent.map_err(|_| self.terminal_error())?;
            }
        }

        let outcome = tokio::select! {
            biased;
            outcome = result_rx => outcome,
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            _ = done.cancelled() => return Err(self.terminal_error()),
            _ = &mut deadline => {
                warn!(%id, method, "call timed out");
                return Err(RpcError::timeout(timeout));
            }
        };

        outcome.unwrap_or_else(|_| Err(self.terminal_error()))
    }

    /// Queue a notification without waiting
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> RpcResult<()> {
        self.notify_with(&CancellationToken::new(), method, params)
    }

    /// Queue a notification unless `cancel` already fired.
    ///
    /// Fails with [`RpcError::NotificationQueueFull`] instead of waiting
    /// when the buffer is full.
    pub fn notify_with<P: Serialize>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
    ) -> RpcResult<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        let queued = QueuedNotification {
            method: method.to_string(),
            params: encode_params(&params)?,
        };

        match self.inner.notify_tx.try_send(queued) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(queued)) => {
                self.inner.stats.record_notification_dropped();
                let capacity = self.inner.config.notification_buffer;
                warn!(connection = %self.inner.name, method = %queued.method, capacity, "notification queue full");
                Err(RpcError::NotificationQueueFull { capacity })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.terminal_error()),
        }
    }

    /// Write a notification immediately, bypassing the buffer.
    ///
    /// Waits for the writer, so it must not be used where the writer could
    /// be waiting on the caller.
    pub async fn notify_direct<P: Serialize>(&self, method: &str, params: P) -> RpcResult<()> {
        self.ensure_open()?;
        let mut notification = Notification::new(method);
        notification.params = encode_params(&params)?;

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(self.terminal_error()),
            written = self.inner.wire.write(notification.into()) => written,
        }
    }

    /// Close the connection.
    ///
    /// Idempotent: the shutdown runs once and every caller, concurrent or
    /// later, gets its outcome.
    #[instrument(skip(self), fields(connection = %self.inner.name))]
    pub async fn close(&self) -> RpcResult<()> {
        self.inner
            .close_outcome
            .get_or_init(|| self.inner.close_once())
            .await
            .clone()
    }

    /// Resolve once the peer disconnects or the connection is closed.
    ///
    /// A local `close` yields `Ok`; losing the peer yields
    /// [`RpcError::Disconnected`] carrying the reason, even if `close` was
    /// called afterwards.
    pub async fn wait(&self) -> RpcResult<()> {
        self.inner.liveness.done.cancelled().await;
        match self.disconnect_reason() {
            Some(reason) => Err(RpcError::disconnected(reason)),
            None => Ok(()),
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.liveness.closed.load(Ordering::SeqCst)
    }

    /// Whether the connection can no longer carry traffic
    pub fn is_done(&self) -> bool {
        self.inner.liveness.done.is_cancelled()
    }

    /// Why the peer side ended, if it did
    pub fn disconnect_reason(&self) -> Option<String> {
        self.inner.liveness.reason.lock().clone()
    }

    /// Observe every message crossing the wire
    pub fn subscribe(&self) -> Subscriber {
        self.inner.stream.subscribe()
    }

    pub fn stream(&self) -> &StreamBroadcast {
        &self.inner.stream
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Record a lifecycle transition; see [`StateMachine::set`]
    pub fn set_state(&self, state: ConnectionState) -> RpcResult<()> {
        self.inner.state.set(state)
    }

    /// Fail unless the lifecycle is exactly at `state`
    pub fn require_state(&self, state: ConnectionState) -> RpcResult<()> {
        self.inner.state.require(state)
    }

    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.inner.state.on_change(callback);
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot(self.inner.pending.len())
    }

    /// Whether two handles drive the same connection
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn ensure_open(&self) -> RpcResult<()> {
        match self.inner.liveness.terminal_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn terminal_error(&self) -> RpcError {
        self.inner
            .liveness
            .terminal_error()
            .unwrap_or(RpcError::ConnectionClosed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
