//! Lifecycle events of a managed connection

use crate::error::RpcError;
use crate::state::ConnectionState;
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Something that happened to a managed connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection became usable (initially or after reconnecting)
    Connected,
    /// The connection went away; `reason` is `None` for a local shutdown
    Disconnected { reason: Option<String> },
    /// A lifecycle step failed
    Error(RpcError),
    /// A reconnection attempt is about to start after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// The protocol lifecycle moved
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Error(_) => "error",
            Self::Reconnecting { .. } => "reconnecting",
            Self::StateChanged { .. } => "state_changed",
        }
    }
}

/// Event observer
pub type EventObserver = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventBus {
    observers: RwLock<Vec<EventObserver>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self, observer: EventObserver) {
        self.observers.write().push(observer);
    }

    /// Deliver `event` to every observer; a panicking observer is logged
    /// and the rest still run
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let observers = self.observers.read().clone();
        for observer in observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(&event))) {
                error!(
                    event = event.name(),
                    panic = %panic_message(panic.as_ref()),
                    "event observer panicked"
                );
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.read().len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
