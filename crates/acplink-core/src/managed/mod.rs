//! Managed connections and the connection pool
//!
//! A [`ManagedConnection`] wraps a [`Connection`] with what a long-lived
//! peer needs around the raw protocol: lifecycle events, a mirrored
//! protocol state, owned sessions and terminals that are released on
//! shutdown, and optional automatic reconnection.

mod events;
mod pool;
mod reconnect;
mod resources;

#[cfg(test)]
mod tests;

pub use events::{ConnectionEvent, EventObserver};
pub use pool::{ConnectionPool, PoolStats};
pub use reconnect::{Connector, ExponentialBackoff, ReconnectPolicy};
pub use resources::{ManagedResource, SessionRegistry, TerminalRegistry};

use crate::config::ManagedConfig;
use crate::connection::Connection;
use crate::error::{RpcError, RpcResult};
use crate::state::ConnectionState;
use events::EventBus;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Which side of the protocol this connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Serves agent methods; talks to a client
    Agent,
    /// Serves client methods (file system, terminals); talks to an agent
    Client,
}

/// Shutdown progress, entered strictly forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    ShuttingDown = 1,
    Closed = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Closed,
        }
    }
}

struct ManagedInner {
    id: String,
    role: Role,
    config: ManagedConfig,
    connection: RwLock<Connection>,
    generation: AtomicU64,
    state: RwLock<ConnectionState>,
    shutdown_state: AtomicU8,
    events: EventBus,
    sessions: SessionRegistry,
    terminals: Option<TerminalRegistry>,
    lifecycle: CancellationToken,
    reconnect: ReconnectPolicy,
    connector: Option<Arc<dyn Connector>>,
}

impl ManagedInner {
    fn emit(&self, event: ConnectionEvent) {
        self.events.emit(event);
    }
}

/// Mirror a connection's lifecycle into the managed state and event stream
fn mirror_state(inner: &Arc<ManagedInner>, connection: &Connection) {
    *inner.state.write() = connection.state();
    let generation = inner.generation.load(Ordering::SeqCst);
    let weak: Weak<ManagedInner> = Arc::downgrade(inner);
    connection.on_state_change(move |from, to| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        // A replaced connection may still report transitions.
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *inner.state.write() = to;
        inner.emit(ConnectionEvent::StateChanged { from, to });
    });
}

/// Configures and starts a [`ManagedConnection`]
pub struct ManagedConnectionBuilder {
    id: String,
    role: Role,
    connection: Connection,
    config: ManagedConfig,
    connector: Option<Arc<dyn Connector>>,
    policy: Option<ReconnectPolicy>,
    observers: Vec<EventObserver>,
}

impl ManagedConnectionBuilder {
    pub fn config(mut self, config: ManagedConfig) -> Self {
        self.config = config;
        self
    }

    /// How to build a replacement connection when reconnecting
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Override the policy derived from `config.reconnect`, e.g. to add hooks
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Observe events from the very first `Connected`
    pub fn on_event<F>(mut self, observer: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Start managing the connection.
    ///
    /// When reconnection is enabled and a connector is set, a supervisor
    /// task replaces the connection after an unexpected disconnect.
    pub fn start(self) -> ManagedConnection {
        let reconnect = self
            .policy
            .unwrap_or_else(|| ReconnectPolicy::new(self.config.reconnect.clone()));
        let supervise = reconnect.is_enabled() && self.connector.is_some();

        let events = EventBus::default();
        for observer in self.observers {
            events.subscribe(observer);
        }

        let inner = Arc::new(ManagedInner {
            id: self.id,
            role: self.role,
            config: self.config,
            state: RwLock::new(self.connection.state()),
            connection: RwLock::new(self.connection.clone()),
            generation: AtomicU64::new(0),
            shutdown_state: AtomicU8::new(ShutdownState::Running as u8),
            events,
            sessions: SessionRegistry::new(),
            terminals: (self.role == Role::Client).then(TerminalRegistry::new),
            lifecycle: CancellationToken::new(),
            reconnect,
            connector: self.connector,
        });

        mirror_state(&inner, &self.connection);
        info!(id = %inner.id, role = ?inner.role, supervise, "managed connection started");
        inner.emit(ConnectionEvent::Connected);

        if supervise {
            tokio::spawn(supervise_connection(
                Arc::downgrade(&inner),
                inner.lifecycle.clone(),
            ));
        }

        ManagedConnection { inner }
    }
}

/// Wait for disconnects and reconnect until shutdown or the budget runs out
async fn supervise_connection(inner: Weak<ManagedInner>, lifecycle: CancellationToken) {
    loop {
        let Some(connection) = inner.upgrade().map(|i| i.connection.read().clone()) else {
            return;
        };

        tokio::select! {
            biased;
            _ = lifecycle.cancelled() => return,
            _ = connection.wait() => {}
        }
        if lifecycle.is_cancelled() {
            return;
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.connection.read().ptr_eq(&connection) {
            // Replaced by an explicit reconnect; watch the new one.
            continue;
        }
        if connection.is_closed() {
            return;
        }
        let managed = ManagedConnection { inner };
        managed.inner.emit(ConnectionEvent::Disconnected {
            reason: connection.disconnect_reason(),
        });

        if let Err(e) = managed.reconnect(&lifecycle).await {
            if !matches!(e, RpcError::Cancelled) {
                warn!(id = %managed.inner.id, error = %e, "giving up on connection");
                managed.inner.emit(ConnectionEvent::Error(e));
            }
            return;
        }
    }
}

/// A connection with lifecycle management.
///
/// Cheap to clone; clones share the same managed state.
#[derive(Clone)]
pub struct ManagedConnection {
    inner: Arc<ManagedInner>,
}

impl ManagedConnection {
    pub fn builder(id: impl Into<String>, role: Role, connection: Connection) -> ManagedConnectionBuilder {
        ManagedConnectionBuilder {
            id: id.into(),
            role,
            connection,
            config: ManagedConfig::default(),
            connector: None,
            policy: None,
            observers: Vec::new(),
        }
    }

    /// Manage `connection` with default configuration and no reconnection
    pub fn new(id: impl Into<String>, role: Role, connection: Connection) -> Self {
        Self::builder(id, role, connection).start()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// The current underlying connection
    pub fn connection(&self) -> Connection {
        self.inner.connection.read().clone()
    }

    /// Mirrored protocol state of the current connection
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.inner.shutdown_state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_state() == ShutdownState::Running
    }

    pub fn on_event<F>(&self, observer: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(Arc::new(observer));
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Terminal handles; only the client role owns terminals
    pub fn terminals(&self) -> Option<&TerminalRegistry> {
        self.inner.terminals.as_ref()
    }

    /// Token cancelled when shutdown begins its final phase
    pub fn lifecycle_token(&self) -> CancellationToken {
        self.inner.lifecycle.child_token()
    }

    /// Replace the connection with a fresh one from the connector.
    ///
    /// The previous connection is closed once the new one is in place.
    /// Emits `Reconnecting` for every attempt and `Connected` on success.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> RpcResult<()> {
        if !self.is_running() {
            return Err(RpcError::ConnectionClosed);
        }
        let connector = self
            .inner
            .connector
            .clone()
            .ok_or_else(|| RpcError::config("no connector configured for reconnection"))?;

        let inner = Arc::clone(&self.inner);
        let fresh = self
            .inner
            .reconnect
            .run(connector.as_ref(), cancel, move |event| inner.emit(event))
            .await?;

        if !self.is_running() {
            fresh.close().await.ok();
            return Err(RpcError::ConnectionClosed);
        }

        let old = std::mem::replace(&mut *self.inner.connection.write(), fresh.clone());
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        mirror_state(&self.inner, &fresh);
        info!(id = %self.inner.id, previous = %old.id(), current = %fresh.id(), "connection replaced");
        if let Err(e) = old.close().await {
            debug!(id = %self.inner.id, error = %e, "closing previous connection failed");
        }

        self.inner.emit(ConnectionEvent::Connected);
        Ok(())
    }

    /// Shut down exactly once.
    ///
    /// Releases terminals, then deletes sessions, within the configured
    /// shutdown timeout and until `cancel` fires; then closes the
    /// connection. Every failure is collected into one
    /// [`RpcError::Aggregate`]. Calls after the first return `Ok(())`.
    #[instrument(skip(self, cancel), fields(id = %self.inner.id))]
    pub async fn shutdown(&self, cancel: &CancellationToken) -> RpcResult<()> {
        if self
            .inner
            .shutdown_state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::ShuttingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        self.inner.emit(ConnectionEvent::Disconnected { reason: None });

        let timeout = self.inner.config.shutdown_timeout;
        let release = async {
            let mut errors = Vec::new();
            if let Some(terminals) = &self.inner.terminals {
                errors.extend(terminals.release_all().await);
            }
            errors.extend(self.inner.sessions.delete_all().await);
            errors
        };

        let mut errors = tokio::select! {
            biased;
            errors = release => errors,
            _ = cancel.cancelled() => vec![RpcError::Cancelled],
            _ = tokio::time::sleep(timeout) => vec![RpcError::timeout(timeout)],
        };

        self.inner.lifecycle.cancel();
        if let Err(e) = self.connection().close().await {
            errors.push(e);
        }
        self.inner
            .shutdown_state
            .store(ShutdownState::Closed as u8, Ordering::SeqCst);

        match RpcError::aggregate(errors) {
            Some(err) => {
                warn!(error = %err, "shutdown completed with errors");
                self.inner.emit(ConnectionEvent::Error(err.clone()));
                Err(err)
            }
            None => {
                info!("managed connection shut down");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("shutdown", &self.shutdown_state())
            .finish()
    }
}
