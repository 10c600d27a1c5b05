//! Inbound side: the read loop and the dispatch loop

use super::pending::PendingCalls;
use super::stats::StatsCounters;
use super::wire::Wire;
use super::{Connection, Inner, Liveness};
use crate::error::{ProtocolError, RpcError};
use crate::handler::{HandlerRegistry, InboundMessage};
use crate::protocol::{Message, Response};
use crate::stream::{Direction, StreamBroadcast, StreamMessage};
use crate::transport::MessageReader;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Error responses the read loop may have outstanding before it drops more
pub(crate) const REJECTION_BUFFER: usize = 16;

pub(crate) struct ReadLoop {
    pub(crate) name: String,
    pub(crate) reader: Box<dyn MessageReader>,
    pub(crate) inbound: mpsc::Sender<InboundMessage>,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) rejections: mpsc::Sender<Response>,
    pub(crate) stream: StreamBroadcast,
    pub(crate) stats: Arc<StatsCounters>,
    pub(crate) liveness: Arc<Liveness>,
    pub(crate) shutdown: CancellationToken,
}

impl ReadLoop {
    /// Read until EOF, a fatal transport error, or shutdown.
    ///
    /// Responses are routed here directly so a handler blocked on a call
    /// can never stall the response it is waiting for.
    pub(crate) async fn run(mut self) {
        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                next = self.reader.receive() => next,
            };

            match next {
                Ok(Some(message)) => self.route(message),
                Err(RpcError::InvalidRequest { id, error }) => {
                    warn!(connection = %self.name, %id, code = error.code, "answering undecodable request");
                    self.stats.record_inbound();
                    self.reject(Response::error(id, error));
                }
                Ok(None) => {
                    debug!(connection = %self.name, "peer closed the connection");
                    break "peer closed the connection".to_string();
                }
                Err(e) => {
                    error!(connection = %self.name, error = %e, "transport read failed");
                    break e.to_string();
                }
            }
        };

        if self.shutdown.is_cancelled() {
            return;
        }
        let err = RpcError::disconnected(reason.clone());
        self.liveness.mark_disconnected(reason);
        self.pending.fail_all(&err);
        self.stream.close();
        self.liveness.done.cancel();
    }

    fn route(&self, message: Message) {
        self.stats.record_inbound();
        self.stream
            .broadcast(StreamMessage::new(Direction::Incoming, &message));

        let inbound = match message {
            Message::Response(response) => {
                self.pending.complete(response);
                return;
            }
            Message::Request(request) => InboundMessage::Request(request),
            Message::Notification(notification) => InboundMessage::Notification(notification),
        };

        match self.inbound.try_send(inbound) {
            Ok(()) => {}
            Err(TrySendError::Full(InboundMessage::Request(request))) => {
                self.stats.record_inbound_rejected();
                warn!(connection = %self.name, method = %request.method, id = %request.id, "dispatch queue full, rejecting request");
                self.reject(Response::error(request.id, ProtocolError::too_many_requests()));
            }
            Err(TrySendError::Full(InboundMessage::Notification(notification))) => {
                self.stats.record_inbound_rejected();
                warn!(connection = %self.name, method = %notification.method, "dispatch queue full, dropping notification");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %self.name, "dispatch loop gone, discarding inbound message");
            }
        }
    }

    /// Queue an error response without waiting; dropped if the writer is backed up
    fn reject(&self, response: Response) {
        if let Err(TrySendError::Full(response)) = self.rejections.try_send(response) {
            warn!(connection = %self.name, id = %response.id, "rejection backlog full, not answering");
        }
    }
}

/// Write error responses queued by the read loop
pub(crate) async fn run_rejection_writer(
    mut rejections: mpsc::Receiver<Response>,
    wire: Arc<Wire>,
    shutdown: CancellationToken,
) {
    loop {
        let response = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            response = rejections.recv() => match response {
                Some(response) => response,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            written = wire.write(response.into()) => written,
        };
        if let Err(e) = written {
            debug!(error = %e, "failed to write rejection");
        }
    }

    debug!("rejection writer stopped");
}

/// Run handlers one inbound message at a time, in arrival order
pub(crate) async fn run_dispatch(
    inner: Weak<Inner>,
    registry: Arc<HandlerRegistry>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    wire: Arc<Wire>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let conn = Connection { inner };

        let request_id = match &message {
            InboundMessage::Request(request) => Some(request.id.clone()),
            InboundMessage::Notification(_) => None,
        };
        debug!(connection = %conn.name(), method = message.method(), "dispatching inbound message");

        // The handler runs to completion even if the connection closes
        // meanwhile; it may be the one closing it.
        let outcome = registry.handle(&conn, message).await;
        drop(conn);

        if let (Some(id), Some(outcome)) = (request_id, outcome) {
            let response = Response::from_result(id, outcome);
            let written = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                written = wire.write(response.into()) => written,
            };
            if let Err(e) = written {
                warn!(error = %e, "failed to write response");
            }
        }
    }

    debug!("dispatch loop stopped");
}
