//! In-memory transport pair
//!
//! Two transports wired back to back over [`tokio::io::duplex`]: whatever one
//! side writes the other side reads. Closing one side's writer is seen by
//! the other side as EOF, exactly like a peer process exiting.

use super::{DEFAULT_MAX_LINE_BYTES, Transport};

/// Create a connected pair of transports with `buffer` bytes of pipe capacity
pub fn pair(buffer: usize) -> (Transport, Transport) {
    let (left, right) = tokio::io::duplex(buffer);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);

    (
        Transport::from_streams(left_read, left_write, DEFAULT_MAX_LINE_BYTES),
        Transport::from_streams(right_read, right_write, DEFAULT_MAX_LINE_BYTES),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, Notification};

    #[tokio::test]
    async fn test_pair_is_looped_back() {
        let (a, b) = pair(4096);
        let (mut a_reader, mut a_writer) = a.into_parts();
        let (mut b_reader, mut b_writer) = b.into_parts();

        a_writer
            .send(&Message::from(Notification::new("a->b")))
            .await
            .unwrap();
        b_writer
            .send(&Message::from(Notification::new("b->a")))
            .await
            .unwrap();

        assert_eq!(b_reader.receive().await.unwrap().unwrap().method(), Some("a->b"));
        assert_eq!(a_reader.receive().await.unwrap().unwrap().method(), Some("b->a"));

        a_writer.close().await.unwrap();
        assert!(b_reader.receive().await.unwrap().is_none());
    }
}
