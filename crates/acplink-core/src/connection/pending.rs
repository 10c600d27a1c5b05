//! Outstanding calls awaiting a response

use crate::error::RpcError;
use crate::protocol::{RequestId, Response};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub(crate) type CallOutcome = Result<Value, RpcError>;

/// Response slots keyed by request id
#[derive(Default)]
pub(crate) struct PendingCalls {
    slots: Mutex<HashMap<RequestId, oneshot::Sender<CallOutcome>>>,
}

/// A caller's claim on its response slot; dropping it forgets the call
pub(crate) struct PendingSlot<'a> {
    pending: &'a PendingCalls,
    id: RequestId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl PendingCalls {
    pub(crate) fn insert(&self, id: RequestId, tx: oneshot::Sender<CallOutcome>) {
        self.slots.lock().insert(id, tx);
    }

    /// Insert a slot owned by the waiting caller
    pub(crate) fn register(&self, id: RequestId, tx: oneshot::Sender<CallOutcome>) -> PendingSlot<'_> {
        self.insert(id.clone(), tx);
        PendingSlot { pending: self, id }
    }

    /// Whether a caller is still waiting on `id`
    pub(crate) fn is_waiting(&self, id: &RequestId) -> bool {
        self.slots.lock().get(id).is_some_and(|tx| !tx.is_closed())
    }

    /// Forget a call whose caller stopped waiting
    pub(crate) fn remove(&self, id: &RequestId) {
        self.slots.lock().remove(id);
    }

    /// Deliver an error to one call
    pub(crate) fn fail(&self, id: &RequestId, err: RpcError) {
        if let Some(tx) = self.slots.lock().remove(id) {
            let _ = tx.send(Err(err));
        }
    }

    /// Route a response to its caller
    pub(crate) fn complete(&self, response: Response) {
        let id = response.id.clone();
        let Some(tx) = self.slots.lock().remove(&id) else {
            warn!(%id, "received response for unknown request");
            return;
        };

        let outcome = response.into_result().map_err(RpcError::Protocol);
        if tx.send(outcome).is_err() {
            debug!(%id, "caller stopped waiting before the response arrived");
        }
    }

    /// Fail every outstanding call with `err`
    pub(crate) fn fail_all(&self, err: &RpcError) {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        for (id, tx) in drained {
            debug!(%id, error = %err, "failing pending call");
            let _ = tx.send(Err(err.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_routes_by_id() {
        let pending = PendingCalls::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.insert(RequestId::Number(1), tx1);
        pending.insert(RequestId::Number(2), tx2);

        pending.complete(Response::error(2i64, ProtocolError::not_found()));
        pending.complete(Response::success(1i64, json!("one")));
        pending.complete(Response::success(99i64, json!("stray")));

        assert_eq!(rx1.await.unwrap().unwrap(), json!("one"));
        match rx2.await.unwrap() {
            Err(RpcError::Protocol(e)) => assert_eq!(e.code, -32004),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending = PendingCalls::default();
        let (tx, rx) = oneshot::channel();
        pending.insert(RequestId::from("a"), tx);

        pending.fail_all(&RpcError::disconnected("eof"));
        assert!(matches!(rx.await.unwrap(), Err(RpcError::Disconnected { .. })));
    }

    #[test]
    fn test_slot_released_when_caller_leaves() {
        let pending = PendingCalls::default();
        let id = RequestId::Number(3);
        let (tx, rx) = oneshot::channel();

        let slot = pending.register(id.clone(), tx);
        assert!(pending.is_waiting(&id));

        drop(rx);
        assert!(!pending.is_waiting(&id));
        assert_eq!(pending.len(), 1);

        drop(slot);
        assert_eq!(pending.len(), 0);
    }
}
