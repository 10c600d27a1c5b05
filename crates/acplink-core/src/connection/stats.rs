//! Connection traffic counters

use crate::protocol::Message;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct StatsCounters {
    calls_issued: AtomicU64,
    notifications_sent: AtomicU64,
    responses_sent: AtomicU64,
    inbound_messages: AtomicU64,
    notifications_dropped: AtomicU64,
    inbound_rejected: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_outgoing(&self, message: &Message) {
        let counter = match message {
            Message::Request(_) => &self.calls_issued,
            Message::Notification(_) => &self.notifications_sent,
            Message::Response(_) => &self.responses_sent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_inbound(&self) {
        self.inbound_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_inbound_rejected(&self) {
        self.inbound_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, pending_calls: usize) -> ConnectionStats {
        ConnectionStats {
            calls_issued: self.calls_issued.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            inbound_messages: self.inbound_messages.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            inbound_rejected: self.inbound_rejected.load(Ordering::Relaxed),
            pending_calls,
        }
    }
}

/// Point-in-time traffic counters of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Requests written to the transport
    pub calls_issued: u64,
    /// Notifications written to the transport
    pub notifications_sent: u64,
    /// Responses written for inbound requests
    pub responses_sent: u64,
    /// Messages received from the peer
    pub inbound_messages: u64,
    /// Notifications rejected because the outbound buffer was full
    pub notifications_dropped: u64,
    /// Inbound messages refused because the dispatch queue was full
    pub inbound_rejected: u64,
    /// Calls awaiting a response, including ones not yet written
    pub pending_calls: usize,
}
