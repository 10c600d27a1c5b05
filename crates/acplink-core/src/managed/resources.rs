//! Child resources owned by a managed connection
//!
//! Sessions and terminals are tracked so shutdown can release them. Each
//! resource decides what releasing means (deleting a session, killing a
//! terminal process) through [`ManagedResource::release`].

use crate::error::{RpcError, RpcResult};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// A resource that must be released when its connection shuts down
#[async_trait]
pub trait ManagedResource: Send + Sync {
    /// Stable identifier (session id, terminal id)
    fn id(&self) -> &str;

    /// Release the resource
    async fn release(&self) -> RpcResult<()>;
}

#[derive(Default)]
struct ResourceSet {
    items: DashMap<String, Arc<dyn ManagedResource>>,
}

impl ResourceSet {
    fn track(&self, resource: Arc<dyn ManagedResource>) -> Option<Arc<dyn ManagedResource>> {
        self.items.insert(resource.id().to_string(), resource)
    }

    fn get(&self, id: &str) -> Option<Arc<dyn ManagedResource>> {
        self.items.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn remove(&self, id: &str) -> Option<Arc<dyn ManagedResource>> {
        self.items.remove(id).map(|(_, resource)| resource)
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.items.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Detach everything, then release concurrently and collect failures
    async fn release_all(&self, kind: &'static str) -> Vec<RpcError> {
        let drained: Vec<Arc<dyn ManagedResource>> = self
            .ids()
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect();

        let outcomes = join_all(drained.iter().map(|resource| async move {
            let result = resource.release().await;
            match &result {
                Ok(()) => debug!(kind, id = resource.id(), "released"),
                Err(e) => warn!(kind, id = resource.id(), error = %e, "release failed"),
            }
            result
        }))
        .await;

        outcomes.into_iter().filter_map(Result::err).collect()
    }
}

/// Sessions created on a connection
#[derive(Default)]
pub struct SessionRegistry {
    set: ResourceSet,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session; returns the one it replaced, if any
    pub fn track(&self, session: Arc<dyn ManagedResource>) -> Option<Arc<dyn ManagedResource>> {
        self.set.track(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ManagedResource>> {
        self.set.get(id)
    }

    /// Stop tracking a session without releasing it
    pub fn remove(&self, id: &str) -> Option<Arc<dyn ManagedResource>> {
        self.set.remove(id)
    }

    /// Delete every tracked session, returning each failure
    pub async fn delete_all(&self) -> Vec<RpcError> {
        self.set.release_all("session").await
    }

    pub fn ids(&self) -> Vec<String> {
        self.set.ids()
    }

    pub fn len(&self) -> usize {
        self.set.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.items.is_empty()
    }
}

/// Terminals a client-side connection has handed out
#[derive(Default)]
pub struct TerminalRegistry {
    set: ResourceSet,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, terminal: Arc<dyn ManagedResource>) -> Option<Arc<dyn ManagedResource>> {
        self.set.track(terminal)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ManagedResource>> {
        self.set.get(id)
    }

    /// Release one terminal; `Ok(false)` if it was not tracked
    pub async fn release(&self, id: &str) -> RpcResult<bool> {
        match self.set.remove(id) {
            Some(terminal) => terminal.release().await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Release every tracked terminal, returning each failure
    pub async fn release_all(&self) -> Vec<RpcError> {
        self.set.release_all("terminal").await
    }

    pub fn ids(&self) -> Vec<String> {
        self.set.ids()
    }

    pub fn len(&self) -> usize {
        self.set.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.items.is_empty()
    }
}
