//! Link RPC: framing & request/response over a per-peer stream (spec
//! component C).

pub mod channel;
pub mod message;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_timer::Delay;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::core::async_runtime as rt;
use crate::core::identity::NodeId;

pub use channel::{new_event_channel, RpcEvent, RpcEventRx, RpcEventTx};
pub use message::{Envelope, RpcMessage};
pub use stream::{InMemoryTransport, RpcTransport, StreamState};

/// How long `ping` waits for a matching `pong` before resolving `false`.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

struct Link {
    transport: Arc<dyn RpcTransport>,
}

/// Maintains the `node_id -> stream` map and the ping/pong waiter
/// table. Owns every stream handle exclusively — the routing table
/// only ever holds ids (spec.md §9 design note).
pub struct LinkRpc {
    self_id: NodeId,
    links: Mutex<HashMap<NodeId, Link>>,
    pending_pings: Mutex<HashMap<Uuid, oneshot::Sender<bool>>>,
    events: RpcEventTx,
}

impl LinkRpc {
    pub fn new(self_id: NodeId) -> (Arc<Self>, RpcEventRx) {
        let (tx, rx) = new_event_channel();
        let rpc = Arc::new(LinkRpc {
            self_id,
            links: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            events: tx,
        });
        (rpc, rx)
    }

    /// Installs `transport` for `node`, and spawns the task that reads
    /// `inbound` frames and dispatches them (spec.md §4.C: "install
    /// handlers for `on_message`, `on_close`, `on_error`").
    ///
    /// Emits `RpcEvent::Listening(node)` immediately.
    pub fn attach(
        self: &Arc<Self>,
        node: NodeId,
        transport: Arc<dyn RpcTransport>,
        mut inbound: mpsc::UnboundedReceiver<String>,
    ) {
        {
            let mut links = self.links.lock();
            links.insert(node, Link { transport: transport.clone() });
        }
        let _ = self.events.send(RpcEvent::Listening(node));

        let this = self.clone();
        rt::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                this.handle_frame(node, &frame).await;
            }
            this.on_stream_closed(node);
        });
    }

    async fn handle_frame(self: &Arc<Self>, from: NodeId, frame: &str) {
        let msg = match RpcMessage::from_frame(frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping malformed RPC frame");
                return;
            }
        };
        match &msg {
            RpcMessage::Ping { id, .. } => {
                let pong = RpcMessage::Pong {
                    id: *id,
                    sender: self.self_id,
                };
                self.send_raw(from, &pong).await;
                let _ = self.events.send(RpcEvent::Ping(from));
            }
            RpcMessage::Pong { id, sender } => {
                let waiter = self.pending_pings.lock().remove(id);
                if let Some(tx) = waiter {
                    let _ = tx.send(true);
                }
                let _ = self.events.send(RpcEvent::Message(msg.clone(), *sender));
            }
            RpcMessage::UserMessage { sender, .. } | RpcMessage::Signaling { sender, .. } => {
                let sender = *sender;
                let _ = self.events.send(RpcEvent::Message(msg, sender));
            }
        }
    }

    fn on_stream_closed(&self, node: NodeId) {
        self.links.lock().remove(&node);
    }

    async fn send_raw(&self, node: NodeId, msg: &RpcMessage) -> bool {
        let transport = { self.links.lock().get(&node).map(|l| l.transport.clone()) };
        match transport {
            Some(t) if t.state() == StreamState::Open => t.send(&msg.to_frame()).await,
            _ => false,
        }
    }

    /// Sends `rpc_message` to `node`. `true` if the stream is open and
    /// the frame was handed to the transport; never raises for closed
    /// streams (spec.md §4.C).
    pub async fn send(&self, node: NodeId, rpc_message: &RpcMessage) -> bool {
        self.send_raw(node, rpc_message).await
    }

    /// Sends a fresh `Ping` to `node`. Resolves `true` when the
    /// matching `Pong` arrives, `false` after [`PING_TIMEOUT`] or if
    /// the stream isn't open.
    pub async fn ping(&self, node: NodeId) -> bool {
        let id = Uuid::new_v4();
        let ping = RpcMessage::Ping {
            id,
            sender: self.self_id,
        };
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().insert(id, tx);

        if !self.send_raw(node, &ping).await {
            self.pending_pings.lock().remove(&id);
            return false;
        }

        let outcome = tokio::select! {
            result = rx => result.unwrap_or(false),
            _ = Delay::new(PING_TIMEOUT) => false,
        };
        self.pending_pings.lock().remove(&id);
        outcome
    }

    /// Closes every stream and clears the map.
    pub fn close(&self) {
        let mut links = self.links.lock();
        for (_, link) in links.drain() {
            link.transport.close();
        }
        let mut pending = self.pending_pings.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send(false);
        }
    }

    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.links
            .lock()
            .get(node)
            .map(|l| l.transport.state() == StreamState::Open)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn nid(b: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = b;
        NodeId::from_bytes(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ping_resolves_true_on_matching_pong() {
        let a_id = nid(1);
        let b_id = nid(2);
        let (a, _a_events) = LinkRpc::new(a_id);
        let (b, mut b_events) = LinkRpc::new(b_id);

        let (trans_a, rx_a, trans_b, rx_b) = InMemoryTransport::pair();
        a.attach(b_id, StdArc::new(trans_a), rx_a);
        b.attach(a_id, StdArc::new(trans_b), rx_b);

        // drive b's dispatch loop: relay incoming ping events into pongs
        // is already handled inside handle_frame, so just await the ping.
        let ping_ok = a.ping(b_id).await;
        assert!(ping_ok);

        // b must have observed a Ping event upward.
        let ev = b_events.recv().await.unwrap();
        matches!(ev, RpcEvent::Ping(id) if id == a_id);
    }

    #[tokio::test]
    async fn ping_times_out_without_pong() {
        let a_id = nid(1);
        let b_id = nid(2);
        let (a, _a_events) = LinkRpc::new(a_id);

        let (trans_a, _rx_a, _trans_b, _rx_b) = InMemoryTransport::pair();
        // attach only a's side, with an inbound channel nobody ever sends on.
        let (_tx, rx_dead) = mpsc::unbounded_channel::<String>();
        a.attach(b_id, StdArc::new(trans_a), rx_dead);

        // b never replies with a pong -> times out. Use a short-circuited
        // variant by closing the transport immediately instead of waiting
        // the full 10s in a unit test.
        a.close();
        assert!(!a.ping(b_id).await);
    }

    #[tokio::test]
    async fn send_to_closed_stream_returns_false() {
        let a_id = nid(1);
        let b_id = nid(2);
        let (a, _a_events) = LinkRpc::new(a_id);
        let (trans_a, _rx_a, _trans_b, _rx_b) = InMemoryTransport::pair();
        trans_a.close();
        let (_tx, rx) = mpsc::unbounded_channel();
        a.attach(b_id, StdArc::new(trans_a), rx);

        let msg = RpcMessage::Ping {
            id: Uuid::new_v4(),
            sender: a_id,
        };
        assert!(!a.send(b_id, &msg).await);
    }
}
