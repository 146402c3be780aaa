//! Event sink (spec component H).
//!
//! The reference source wires components together with an
//! inheritance-plus-event-emitter pattern. Per the design note in
//! spec.md §9 this is re-architected as typed message passing: a
//! single `Event` enum broadcast on a `tokio::sync::broadcast` channel
//! owned by the `DhtNode`, rather than a global emitter with a
//! per-event listener-cap footgun. Subscribers clone the `Receiver`;
//! emission is synchronous relative to the producing operation (a
//! `send` on a broadcast channel never awaits).

use serde_json::Value;
use tokio::sync::broadcast;

use crate::core::identity::NodeId;
use crate::core::rpc::Envelope;

/// Default capacity of the broadcast channel's ring buffer. Slow
/// subscribers that fall behind this many events receive a `Lagged`
/// error on their next `recv` rather than stalling the producer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Name/payload pairs emitted by the DHT's components.
#[derive(Debug, Clone)]
pub enum Event {
    /// A frame was handed to the transport for `NodeId`.
    Sent { to: NodeId },
    /// A message is being forwarded toward `recipient` via `via`.
    Forward { recipient: NodeId, via: NodeId },
    /// A message was admitted into the store-and-forward cache.
    Cache { recipient: NodeId },
    /// A cached message was successfully re-delivered.
    Delivered { recipient: NodeId },
    /// Opaque visualization/telemetry hook, for UI consumers external
    /// to the core.
    Visualization(Value),
    /// A newly added node answered a liveness ping.
    Ready(NodeId),
    /// A `message`-typed RPC addressed to us arrived.
    ChatMessage(Envelope),
    /// A `signaling`-typed RPC addressed to us arrived (after dedup).
    SignalingMessage(Envelope),
    /// The message cache was admitted a new entry.
    MessageCached,
    /// The message cache became empty after a TTL/delivery sweep.
    EmptyCache,
}

/// Owns the broadcast channel; lifetimes are scoped to the owning
/// `DhtNode`, per the design note in spec.md §9 ("No global emitter").
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Event>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CAPACITY);
        EventSink { tx }
    }

    /// Subscribes a new listener. Many listeners may be attached per
    /// event, matching spec.md §4.H.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emits `event` to every current subscriber. A no-op (not an
    /// error) if there are no subscribers.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(b: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = b;
        NodeId::from_bytes(&bytes).unwrap()
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let sink = EventSink::new();
        let mut r1 = sink.subscribe();
        let mut r2 = sink.subscribe();
        sink.emit(Event::Ready(nid(1)));
        assert!(matches!(r1.recv().await.unwrap(), Event::Ready(id) if id == nid(1)));
        assert!(matches!(r2.recv().await.unwrap(), Event::Ready(id) if id == nid(1)));
    }

    #[test]
    fn emit_without_subscribers_is_not_an_error() {
        let sink = EventSink::new();
        sink.emit(Event::EmptyCache);
    }
}
