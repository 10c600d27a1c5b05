//! Stream broadcast: observability tap on wire traffic
//!
//! Every message a connection sends or receives is offered to the stream
//! broadcast as a [`StreamMessage`]. Subscribers are strictly best-effort:
//! a subscriber that falls behind loses messages, and nothing it does can
//! slow the protocol path.

mod broadcast;
mod message;

pub use broadcast::{DEFAULT_SUBSCRIBER_CAPACITY, StreamBroadcast, StreamError, Subscriber};
pub use message::{Direction, StreamMessage, StreamPayload};
