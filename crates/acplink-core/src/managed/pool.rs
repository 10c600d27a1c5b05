//! Capacity-bounded collection of managed connections

use super::ManagedConnection;
use crate::config::PoolConfig;
use crate::error::{RpcError, RpcResult};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub max_size: usize,
    /// Connections ever admitted
    pub created: u64,
    /// Connections detached by `remove` or `shutdown`
    pub destroyed: u64,
}

/// String-keyed set of [`ManagedConnection`]s with a size limit
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, ManagedConnection>>,
    max_size: usize,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl ConnectionPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_size,
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.max_size)
    }

    /// Admit `connection` under `id`.
    ///
    /// Fails without changing membership if `id` is taken or the pool is
    /// full.
    pub fn put(&self, id: impl Into<String>, connection: ManagedConnection) -> RpcResult<()> {
        let id = id.into();
        let mut connections = self.connections.write();

        if connections.contains_key(&id) {
            return Err(RpcError::DuplicateConnection { id });
        }
        if connections.len() >= self.max_size {
            return Err(RpcError::PoolFull {
                capacity: self.max_size,
            });
        }

        debug!(%id, size = connections.len() + 1, "connection added to pool");
        connections.insert(id, connection);
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<ManagedConnection> {
        self.connections.read().get(id).cloned()
    }

    /// Detach `id` and shut it down in the background.
    ///
    /// Returns `false` if no such connection was pooled. Must be called
    /// from within a Tokio runtime.
    pub fn remove(&self, id: &str) -> bool {
        let Some(connection) = self.connections.write().remove(id) else {
            return false;
        };

        self.destroyed.fetch_add(1, Ordering::Relaxed);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.shutdown(&CancellationToken::new()).await {
                warn!(%id, error = %e, "pooled connection shut down with errors");
            }
        });
        true
    }

    /// Shut down every pooled connection concurrently.
    ///
    /// The pool is emptied first; every failure is collected into one
    /// [`RpcError::Aggregate`].
    pub async fn shutdown(&self, cancel: &CancellationToken) -> RpcResult<()> {
        let drained: Vec<(String, ManagedConnection)> = self.connections.write().drain().collect();
        info!(count = drained.len(), "shutting down connection pool");

        let outcomes = join_all(drained.iter().map(|(id, connection)| async move {
            let outcome = connection.shutdown(cancel).await;
            if let Err(e) = &outcome {
                warn!(%id, error = %e, "pooled connection shut down with errors");
            }
            outcome
        }))
        .await;
        self.destroyed
            .fetch_add(drained.len() as u64, Ordering::Relaxed);

        let errors: Vec<RpcError> = outcomes.into_iter().filter_map(Result::err).collect();
        match RpcError::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Pooled ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.len(),
            max_size: self.max_size,
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}
