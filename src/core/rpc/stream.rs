//! The abstract "ordered reliable stream" the core consumes (spec.md
//! §6, "Transport (consumed)").
//!
//! The WebRTC session layer itself is explicitly out of scope; this
//! module defines the seam an embedder plugs a real data channel into,
//! and ships one concrete implementation — an in-process duplex pair —
//! used by the crate's own tests and as a template for a real adapter.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Lifecycle state of a stream, per spec.md §6.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StreamState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// An ordered, reliable, message-oriented channel that accepts a
/// single JSON text frame per `send` call.
///
/// Implementations must never block indefinitely on `send`; a closed
/// or backed-up transport should resolve to `false` rather than hang,
/// per the "never raises for closed streams" contract in spec.md §4.C.
#[async_trait::async_trait]
pub trait RpcTransport: Send + Sync {
    /// Hands `frame` to the transport. Returns `true` if accepted,
    /// `false` if the stream is not open.
    async fn send(&self, frame: &str) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> StreamState;

    /// Closes the stream. Idempotent.
    fn close(&self);
}

/// An in-process duplex transport, backed by two `tokio::mpsc`
/// channels. Used by this crate's own tests in place of a real WebRTC
/// data channel, and suitable as a template for one.
pub struct InMemoryTransport {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl InMemoryTransport {
    /// Builds a connected pair: frames sent on `a` arrive on `b`'s
    /// inbound receiver, and vice versa.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>, Self, mpsc::UnboundedReceiver<String>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = InMemoryTransport {
            tx: tx_b,
            closed: Arc::new(AtomicBool::new(false)),
        };
        let b = InMemoryTransport {
            tx: tx_a,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (a, rx_a, b, rx_b)
    }
}

#[async_trait::async_trait]
impl RpcTransport for InMemoryTransport {
    async fn send(&self, frame: &str) -> bool {
        if self.closed.load(AtomicOrdering::Acquire) {
            return false;
        }
        self.tx.send(frame.to_string()).is_ok()
    }

    fn state(&self) -> StreamState {
        if self.closed.load(AtomicOrdering::Acquire) {
            StreamState::Closed
        } else {
            StreamState::Open
        }
    }

    fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paired_transport_delivers_frames() {
        let (a, _rx_a, b, mut rx_b) = InMemoryTransport::pair();
        assert!(a.send("hello").await);
        assert_eq!(rx_b.recv().await, Some("hello".to_string()));
        drop(b);
    }

    #[tokio::test]
    async fn closed_transport_never_sends() {
        let (a, _rx_a, _b, _rx_b) = InMemoryTransport::pair();
        a.close();
        assert_eq!(a.state(), StreamState::Closed);
        assert!(!a.send("hello").await);
    }
}
