//! Outbound call and notification queues
//!
//! Both consumers only write. The caller registers its response slot before
//! queueing and waits on it; the call consumer writes the request and moves
//! on, so one slow response never holds up the next call.

use super::pending::PendingCalls;
use super::wire::Wire;
use crate::protocol::{Notification, Request, RequestId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An outbound call waiting to be written
pub(crate) struct QueuedCall {
    pub(crate) id: RequestId,
    pub(crate) method: String,
    pub(crate) params: Option<Value>,
    pub(crate) cancel: CancellationToken,
}

/// An outbound notification waiting to be written
pub(crate) struct QueuedNotification {
    pub(crate) method: String,
    pub(crate) params: Option<Value>,
}

pub(crate) async fn run_call_consumer(
    mut calls: mpsc::Receiver<QueuedCall>,
    pending: Arc<PendingCalls>,
    wire: Arc<Wire>,
    shutdown: CancellationToken,
) {
    loop {
        let call = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            call = calls.recv() => match call {
                Some(call) => call,
                None => break,
            },
        };

        let id = call.id;
        if call.cancel.is_cancelled() || !pending.is_waiting(&id) {
            debug!(method = %call.method, %id, "skipping call cancelled before issue");
            continue;
        }

        let mut request = Request::new(id.clone(), call.method);
        request.params = call.params;

        let written = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            written = wire.write(request.into()) => written,
        };
        if let Err(e) = written {
            warn!(%id, error = %e, "failed to write request");
            pending.fail(&id, e);
        }
    }

    debug!("call consumer stopped");
}

pub(crate) async fn run_notification_consumer(
    mut notifications: mpsc::Receiver<QueuedNotification>,
    wire: Arc<Wire>,
    shutdown: CancellationToken,
) {
    loop {
        let queued = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            queued = notifications.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };

        let mut notification = Notification::new(queued.method);
        notification.params = queued.params;
        let method = notification.method.clone();

        let written = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            written = wire.write(notification.into()) => written,
        };
        if let Err(e) = written {
            warn!(%method, error = %e, "failed to write notification");
        }
    }

    debug!("notification consumer stopped");
}
