//! The seam to the byte-stream layer.
//!
//! The transport delivers ordered, reliable message blocks in both
//! directions; block boundaries are resolved before the core ever sees the
//! data. Sending is enqueue-and-return; delivery order on the wire matches
//! enqueue order per session. Inbound traffic is pushed into the session by
//! whoever owns the receiving end, via `handle_block` /
//! `handle_transport_closed` on the role wrappers.

use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;
use uplink_protocol::MessageBlock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send on a closed transport")]
    Closed,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Outbound half of a session's connection.
pub trait MessageTransport: Send + Sync {
    /// Enqueues a block for delivery. Non-blocking; failure means the
    /// connection is gone or broken, never "try again later".
    fn send_block(&self, block: MessageBlock) -> Result<(), TransportError>;

    /// Closes the outgoing direction. Idempotent; the incoming direction is
    /// untouched and keeps delivering whatever the peer already sent.
    fn close_outgoing(&self);
}

/// Channel-backed transport connecting two sessions inside one process.
/// Used by the integration tests and by in-process client/relay pairs.
pub struct InProcessTransport {
    outgoing: Mutex<Option<mpsc::UnboundedSender<MessageBlock>>>,
}

impl InProcessTransport {
    /// Creates two connected endpoints. Each returned receiver yields the
    /// blocks sent by the *other* endpoint, plus a final `None` once that
    /// endpoint closes its outgoing direction.
    pub fn pair() -> (
        InProcessTransport,
        mpsc::UnboundedReceiver<MessageBlock>,
        InProcessTransport,
        mpsc::UnboundedReceiver<MessageBlock>,
    ) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();
        (
            InProcessTransport {
                outgoing: Mutex::new(Some(a_to_b_tx)),
            },
            b_to_a_rx,
            InProcessTransport {
                outgoing: Mutex::new(Some(b_to_a_tx)),
            },
            a_to_b_rx,
        )
    }
}

impl MessageTransport for InProcessTransport {
    fn send_block(&self, block: MessageBlock) -> Result<(), TransportError> {
        let guard = self.outgoing.lock().expect("transport lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.send(block).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close_outgoing(&self) {
        // Dropping the sender ends the peer's receiver stream.
        self.outgoing.lock().expect("transport lock poisoned").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplink_protocol::MessageType;

    fn payload_block(data: &[u8]) -> MessageBlock {
        MessageBlock::new(MessageType::Payload, data.to_vec()).expect("block")
    }

    #[tokio::test]
    async fn pair_delivers_in_order_and_signals_close() {
        let (a, _a_rx, _b, mut b_rx) = InProcessTransport::pair();

        a.send_block(payload_block(b"one")).expect("send");
        a.send_block(payload_block(b"two")).expect("send");
        assert_eq!(b_rx.recv().await.expect("recv").payload, b"one");
        assert_eq!(b_rx.recv().await.expect("recv").payload, b"two");

        a.close_outgoing();
        assert!(b_rx.recv().await.is_none());
        assert_eq!(
            a.send_block(payload_block(b"late")),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn close_is_idempotent() {
        let (a, _a_rx, _b, _b_rx) = InProcessTransport::pair();
        a.close_outgoing();
        a.close_outgoing();
    }
}
