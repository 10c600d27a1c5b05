//! Connection assembly

use super::pending::PendingCalls;
use super::queue::{run_call_consumer, run_notification_consumer};
use super::reader::{REJECTION_BUFFER, ReadLoop, run_dispatch, run_rejection_writer};
use super::stats::StatsCounters;
use super::wire::Wire;
use super::{Connection, Inner, Liveness};
use crate::config::ConnectionConfig;
use crate::error::ProtocolError;
use crate::handler::HandlerRegistry;
use crate::state::StateMachine;
use crate::stream::{DEFAULT_SUBSCRIBER_CAPACITY, StreamBroadcast};
use crate::transport::Transport;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Wires a transport, handlers and configuration into a running [`Connection`]
pub struct ConnectionBuilder {
    transport: Transport,
    registry: HandlerRegistry,
    config: ConnectionConfig,
    subscriber_capacity: usize,
}

impl ConnectionBuilder {
    pub(crate) fn new(transport: Transport) -> Self {
        Self {
            transport,
            registry: HandlerRegistry::new(),
            config: ConnectionConfig::default(),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Per-subscriber capacity of the stream broadcast
    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// Replace the handler table wholesale
    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a typed request handler
    pub fn method<P, R, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Connection, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
    {
        self.registry.register_method(method, handler);
        self
    }

    /// Register a request handler over raw params
    pub fn raw_method<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Connection, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProtocolError>> + Send + 'static,
    {
        self.registry.register_raw_method(method, handler);
        self
    }

    /// Register a typed notification handler
    pub fn notification<P, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Connection, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        self.registry.register_notification(method, handler);
        self
    }

    /// Register a notification handler over raw params
    pub fn raw_notification<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Connection, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        self.registry.register_raw_notification(method, handler);
        self
    }

    /// Start the connection's tasks.
    ///
    /// Must be called from within a Tokio runtime. The handler table is
    /// frozen from here on.
    pub fn start(self) -> Connection {
        let ConnectionBuilder {
            transport,
            registry,
            config,
            subscriber_capacity,
        } = self;
        let (reader, writer) = transport.into_parts();

        let stream = StreamBroadcast::with_capacity(subscriber_capacity);
        let stats = Arc::new(StatsCounters::default());
        let pending = Arc::new(PendingCalls::default());
        let wire = Arc::new(Wire::new(writer, stream.clone(), Arc::clone(&stats)));
        let liveness = Arc::new(Liveness::default());
        let shutdown = CancellationToken::new();

        let (call_tx, call_rx) = mpsc::channel(config.call_queue_capacity.max(1));
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_buffer.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer.max(1));
        let (reject_tx, reject_rx) = mpsc::channel(REJECTION_BUFFER);

        let registry = Arc::new(registry);
        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            config,
            registry: Arc::clone(&registry),
            wire: Arc::clone(&wire),
            pending: Arc::clone(&pending),
            stream: stream.clone(),
            stats: Arc::clone(&stats),
            state: StateMachine::new(),
            liveness: Arc::clone(&liveness),
            shutdown: shutdown.clone(),
            call_tx,
            notify_tx,
            next_id: AtomicI64::new(1),
            close_outcome: OnceCell::new(),
        });

        tokio::spawn(
            ReadLoop {
                name: inner.name.clone(),
                reader,
                inbound: inbound_tx,
                pending: Arc::clone(&pending),
                rejections: reject_tx,
                stream,
                stats,
                liveness,
                shutdown: shutdown.clone(),
            }
            .run(),
        );
        tokio::spawn(run_rejection_writer(
            reject_rx,
            Arc::clone(&wire),
            shutdown.clone(),
        ));
        tokio::spawn(run_dispatch(
            Arc::downgrade(&inner),
            registry,
            inbound_rx,
            Arc::clone(&wire),
            shutdown.clone(),
        ));
        tokio::spawn(run_call_consumer(
            call_rx,
            pending,
            Arc::clone(&wire),
            shutdown.clone(),
        ));
        tokio::spawn(run_notification_consumer(notify_rx, wire, shutdown));

        info!(
            connection = %inner.name,
            id = %inner.id,
            methods = inner.registry.methods().len(),
            "connection started"
        );
        Connection { inner }
    }
}
