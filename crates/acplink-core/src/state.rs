//! Connection lifecycle state machine
//!
//! ```text
//! Uninitialized ──▶ Initialized ──▶ Authenticated ──▶ SessionReady ─┐
//!                        │                                ▲   ▲     │
//!                        └────────────────────────────────┘   └─────┘
//! ```
//!
//! The table is enforced strictly: anything off these edges is rejected and
//! the state is left untouched. `SessionReady → SessionReady` is allowed
//! because a ready connection hosts many sequential sessions, but it does
//! not count as a change and notifies nobody.

use crate::error::RpcError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport is up, nothing negotiated yet
    #[default]
    Uninitialized,
    /// `initialize` completed
    Initialized,
    /// Authentication completed
    Authenticated,
    /// Sessions may be created
    SessionReady,
}

/// The transition table
pub fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Uninitialized, Initialized)
            | (Initialized, Authenticated)
            | (Initialized, SessionReady)
            | (Authenticated, SessionReady)
            | (SessionReady, SessionReady)
    )
}

impl ConnectionState {
    /// Whether `self -> to` is an edge of the transition table
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        can_transition(self, to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Authenticated => "authenticated",
            Self::SessionReady => "session_ready",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked with `(old, new)` after a state change
pub type StateCallback = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Thread-safe state tracker with validated transitions and change observers
#[derive(Default)]
pub struct StateMachine {
    state: RwLock<ConnectionState>,
    callbacks: RwLock<Vec<StateCallback>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Move to `new`.
    ///
    /// Callbacks run synchronously on the caller's task, after the state lock
    /// has been released, so a callback may read the state (or even request
    /// a further transition) without deadlocking.
    pub fn set(&self, new: ConnectionState) -> Result<(), RpcError> {
        let old = {
            let mut state = self.state.write();
            let old = *state;
            if !old.can_transition_to(new) {
                return Err(RpcError::InvalidTransition { from: old, to: new });
            }
            *state = new;
            old
        };

        if old == new {
            return Ok(());
        }

        debug!(from = %old, to = %new, "connection state changed");
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(old, new);
        }
        Ok(())
    }

    /// Register a change observer
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Fail unless the connection is exactly in `expected`
    pub fn require(&self, expected: ConnectionState) -> Result<(), RpcError> {
        let current = self.get();
        if current == expected {
            Ok(())
        } else {
            Err(RpcError::InvalidTransition {
                from: current,
                to: expected,
            })
        }
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.get())
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}
