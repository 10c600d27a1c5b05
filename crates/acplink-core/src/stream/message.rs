//! Wire events as seen by stream observers

use crate::error::ProtocolError;
use crate::protocol::{Message, RequestId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Which way a message crossed the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the peer
    Incoming,
    /// Sent to the peer
    Outgoing,
}

/// The message itself, flattened into one of the three JSON-RPC shapes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamPayload {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Result<Value, ProtocolError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// One immutable wire event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    pub direction: Direction,
    pub payload: StreamPayload,
    pub timestamp: DateTime<Utc>,
}

impl StreamMessage {
    /// Snapshot a protocol message crossing the wire now
    pub fn new(direction: Direction, message: &Message) -> Self {
        let payload = match message {
            Message::Request(req) => StreamPayload::Request {
                id: req.id.clone(),
                method: req.method.clone(),
                params: req.params.clone(),
            },
            Message::Response(res) => StreamPayload::Response {
                id: res.id.clone(),
                result: res.clone().into_result(),
            },
            Message::Notification(n) => StreamPayload::Notification {
                method: n.method.clone(),
                params: n.params.clone(),
            },
        };

        Self {
            direction,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match &self.payload {
            StreamPayload::Request { method, .. } | StreamPayload::Notification { method, .. } => {
                Some(method)
            }
            StreamPayload::Response { .. } => None,
        }
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Incoming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Notification, Response};
    use serde_json::json;

    #[test]
    fn test_payload_from_response_error() {
        let msg = Message::from(Response::error(4i64, ProtocolError::forbidden()));
        let event = StreamMessage::new(Direction::Incoming, &msg);

        assert!(event.is_incoming());
        assert!(event.method().is_none());
        match event.payload {
            StreamPayload::Response { id, result } => {
                assert_eq!(id, RequestId::Number(4));
                assert_eq!(result.unwrap_err().code, -32003);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_notification_snapshot_serializes_with_kind_tag() {
        let msg = Message::from(Notification::new("session/update").with_params(json!({"x": 1})));
        let event = StreamMessage::new(Direction::Outgoing, &msg);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["direction"], "outgoing");
        assert_eq!(json["payload"]["kind"], "notification");
        assert_eq!(json["payload"]["method"], "session/update");
    }
}
