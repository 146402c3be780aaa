//! Connection Manager: PEX, min-peer maintenance, bootstrap (spec
//! component G).
//!
//! Owns its own map of per-peer streams labeled `pex`, kept separate
//! from the Link RPC's `dht`-labeled streams (spec.md §6) — the two
//! protocols are independent conversations that happen to ride the
//! same transport abstraction. Connection *initiation* itself (the
//! WebRTC session layer) is an external collaborator (spec.md §1);
//! this module only decides *who* to dial and surfaces that decision
//! through a callback.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::async_runtime::{self as rt, JoinHandle};
use crate::core::config::timing;
use crate::core::error::{Error, Result};
use crate::core::events::{Event, EventSink};
use crate::core::identity::NodeId;
use crate::core::rpc::{RpcTransport, StreamState};

/// Opaque peer-exchange descriptor. The core only ever reads `peerId`
/// (used to route) and `publicKey` (handed to the connection layer);
/// every other field (`age`, `sex`, `searching`, `x`, `y`, `latitude`,
/// `longitude`) passes through untouched, per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PeerDto(pub Value);

impl PeerDto {
    pub fn new(value: Value) -> Self {
        PeerDto(value)
    }

    pub fn peer_id(&self) -> Option<NodeId> {
        self.0.get("peerId")?.as_str()?.parse().ok()
    }

    pub fn public_key(&self) -> Option<&str> {
        self.0.get("publicKey")?.as_str()
    }
}

/// PEX wire format, carried as JSON text on a stream labeled `pex`
/// (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PexMessage {
    #[serde(rename = "request")]
    Request {
        #[serde(rename = "maxNumberOfPeers")]
        max_number_of_peers: usize,
    },
    #[serde(rename = "advertisement")]
    Advertisement { peers: Vec<PeerDto> },
}

impl PexMessage {
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("PexMessage always serializes")
    }

    pub fn from_frame(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| Error::InvalidFrame(e.to_string()))
    }
}

/// Returns the `k` closest known peer ids to `self`, for selecting the
/// "nearest open PEX channel" (spec.md §4.G). Supplied by the
/// embedding `DhtNode` as `routing_table.sort_closest_to_self`, kept
/// as a callback here so this module never touches the routing table
/// directly. Asynchronous because the routing table lives behind the
/// node's async state lock (spec.md §9: id-only routing-table
/// contacts, stream ownership elsewhere).
pub type SortClosestToSelf = Box<dyn Fn(Vec<NodeId>) -> BoxFuture<'static, Vec<NodeId>> + Send + Sync>;
/// Supplies the peers this node currently knows about, to answer an
/// incoming PEX request.
pub type KnownPeers = Box<dyn Fn(usize) -> Vec<PeerDto> + Send + Sync>;
/// User-configurable filter predicate: `true` if this peer is worth
/// dialing (spec.md §4.G).
pub type ConnectFilter = Box<dyn Fn(&PeerDto) -> bool + Send + Sync>;
/// Hands a peer off to the (external) connection-initiation layer.
pub type Dial = Box<dyn Fn(PeerDto) + Send + Sync>;
/// Reports how many live connections the embedder currently holds —
/// connection *accounting* belongs to the WebRTC layer, not this
/// module (spec.md §1).
pub type ConnectionCount = Box<dyn Fn() -> usize + Send + Sync>;

struct PexLink {
    transport: Arc<dyn RpcTransport>,
}

/// Keeps the node connected to at least `min_connections` peers by
/// running a PEX request/advertisement dialogue and surfacing newly
/// discovered peers to the connection layer (spec.md §4.G).
pub struct ConnectionManager {
    self_id: NodeId,
    min_connections: usize,
    initial_delay: Duration,
    check_interval: Duration,
    links: parking_lot::Mutex<HashMap<NodeId, PexLink>>,
    filter: ConnectFilter,
    dial: Dial,
    known_peers: KnownPeers,
    sort_closest: SortClosestToSelf,
    connection_count: ConnectionCount,
    events: EventSink,
    timers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        min_connections: usize,
        filter: ConnectFilter,
        dial: Dial,
        known_peers: KnownPeers,
        sort_closest: SortClosestToSelf,
        connection_count: ConnectionCount,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new(ConnectionManager {
            self_id,
            min_connections,
            initial_delay: timing::PEX_INITIAL_DELAY,
            check_interval: timing::PEX_SWEEP_INTERVAL,
            links: parking_lot::Mutex::new(HashMap::new()),
            filter,
            dial,
            known_peers,
            sort_closest,
            connection_count,
            events,
            timers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Installs a `pex`-labeled stream for `node` and spawns its
    /// inbound dispatch loop.
    pub fn attach_pex_channel(
        self: &Arc<Self>,
        node: NodeId,
        transport: Arc<dyn RpcTransport>,
        mut inbound: mpsc::UnboundedReceiver<String>,
    ) {
        self.links.lock().insert(node, PexLink { transport });
        let this = self.clone();
        rt::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                this.handle_frame(node, &frame).await;
            }
            this.links.lock().remove(&node);
        });
    }

    async fn handle_frame(self: &Arc<Self>, from: NodeId, frame: &str) {
        let msg = match PexMessage::from_frame(frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping malformed PEX frame");
                return;
            }
        };
        match msg {
            PexMessage::Request { max_number_of_peers } => {
                let peers = (self.known_peers)(max_number_of_peers);
                let advertisement = PexMessage::Advertisement { peers };
                self.send_to(from, &advertisement).await;
            }
            PexMessage::Advertisement { peers } => {
                self.events.emit(Event::Visualization(serde_json::json!({
                    "pexAdvertisement": { "from": from.to_hex(), "count": peers.len() }
                })));
                self.handle_new_peers(peers, from);
            }
        }
    }

    async fn send_to(&self, node: NodeId, msg: &PexMessage) -> bool {
        let transport = { self.links.lock().get(&node).map(|l| l.transport.clone()) };
        match transport {
            Some(t) if t.state() == StreamState::Open => t.send(&msg.to_frame()).await,
            _ => false,
        }
    }

    /// Filters already-connected peers and self, dials those that pass
    /// `filter`, and if the total connection count is still short of
    /// `min_connections`, fills the remainder from the leftover list
    /// (spec.md §4.G).
    pub fn handle_new_peers(&self, peers: Vec<PeerDto>, source_channel: NodeId) {
        debug!(source = %source_channel, count = peers.len(), "handling advertised peers");

        let mut accepted = Vec::new();
        let mut leftover = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();

        for peer in peers {
            let id = match peer.peer_id() {
                Some(id) => id,
                None => continue,
            };
            if id == self.self_id || !seen.insert(id) {
                continue;
            }
            if self.links.lock().contains_key(&id) {
                continue;
            }
            if (self.filter)(&peer) {
                accepted.push(peer);
            } else {
                leftover.push(peer);
            }
        }

        for peer in &accepted {
            (self.dial)(peer.clone());
        }

        let connected_after = (self.connection_count)() + accepted.len();
        if connected_after < self.min_connections {
            let remaining = self.min_connections - connected_after;
            for peer in leftover.into_iter().take(remaining) {
                (self.dial)(peer);
            }
        }
    }

    /// Selects the nearest peer with an open PEX channel and asks it
    /// for `min_connections` new peers.
    async fn request_peers_from_nearest(&self) {
        let candidate_ids: Vec<NodeId> = self
            .links
            .lock()
            .iter()
            .filter(|(_, link)| link.transport.state() == StreamState::Open)
            .map(|(id, _)| *id)
            .collect();
        if candidate_ids.is_empty() {
            return;
        }
        let sorted = (self.sort_closest)(candidate_ids).await;
        let nearest = match sorted.into_iter().next() {
            Some(id) => id,
            None => return,
        };
        let request = PexMessage::Request {
            max_number_of_peers: self.min_connections,
        };
        self.send_to(nearest, &request).await;
    }

    /// Starts the bootstrap/sweep loop: one PEX request after
    /// [`timing::PEX_INITIAL_DELAY`], then a periodic sweep every
    /// [`timing::PEX_SWEEP_INTERVAL`] while connections remain below
    /// `min_connections` (spec.md §4.G, §5).
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let initial_delay = self.initial_delay;
        let check_interval = self.check_interval;
        let handle = rt::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            this.request_peers_from_nearest().await;

            let mut interval = tokio::time::interval(check_interval);
            loop {
                interval.tick().await;
                if (this.connection_count)() < this.min_connections {
                    this.request_peers_from_nearest().await;
                }
            }
        });
        self.timers.lock().push(handle);
    }

    /// Cancels the bootstrap/sweep loop and closes every PEX stream.
    pub fn close(&self) {
        for handle in self.timers.lock().drain(..) {
            handle.abort();
        }
        for (_, link) in self.links.lock().drain() {
            link.transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rpc::InMemoryTransport;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    fn nid(b: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = b;
        NodeId::from_bytes(&bytes).unwrap()
    }

    fn peer_dto(id: NodeId) -> PeerDto {
        PeerDto::new(json!({ "peerId": id.to_hex(), "publicKey": "pk" }))
    }

    fn manager(self_id: NodeId, min_connections: usize, dialed: Arc<SyncMutex<Vec<NodeId>>>) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            self_id,
            min_connections,
            Box::new(|_peer: &PeerDto| true),
            Box::new(move |peer: PeerDto| {
                if let Some(id) = peer.peer_id() {
                    dialed.lock().push(id);
                }
            }),
            Box::new(|_max| Vec::new()),
            Box::new(|ids: Vec<NodeId>| Box::pin(async move { ids }) as BoxFuture<'static, Vec<NodeId>>),
            Box::new(|| 0),
            EventSink::new(),
        )
    }

    #[test]
    fn pex_request_round_trips_over_json() {
        let msg = PexMessage::Request { max_number_of_peers: 5 };
        let frame = msg.to_frame();
        assert_eq!(PexMessage::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn peer_dto_opaque_fields_pass_through() {
        let dto = PeerDto::new(json!({
            "peerId": nid(1).to_hex(),
            "publicKey": "pk",
            "age": 30,
            "searching": true,
        }));
        assert_eq!(dto.peer_id(), Some(nid(1)));
        assert_eq!(dto.public_key(), Some("pk"));
    }

    #[test]
    fn handle_new_peers_dials_filtered_candidates() {
        let dialed = Arc::new(SyncMutex::new(Vec::new()));
        let mgr = manager(nid(0), 1, dialed.clone());
        mgr.handle_new_peers(vec![peer_dto(nid(1)), peer_dto(nid(0))], nid(9));
        // self-id is excluded, only the other peer is dialed.
        assert_eq!(*dialed.lock(), vec![nid(1)]);
    }

    #[test]
    fn handle_new_peers_fills_remainder_from_leftover_when_under_min() {
        let dialed = Arc::new(SyncMutex::new(Vec::new()));
        let mgr = ConnectionManager::new(
            nid(0),
            2,
            Box::new(|_peer: &PeerDto| false),
            Box::new({
                let dialed = dialed.clone();
                move |peer: PeerDto| {
                    if let Some(id) = peer.peer_id() {
                        dialed.lock().push(id);
                    }
                }
            }),
            Box::new(|_max| Vec::new()),
            Box::new(|ids: Vec<NodeId>| Box::pin(async move { ids }) as BoxFuture<'static, Vec<NodeId>>),
            Box::new(|| 0),
            EventSink::new(),
        );
        mgr.handle_new_peers(vec![peer_dto(nid(1)), peer_dto(nid(2))], nid(9));
        // filter rejects both, but min_connections=2 pulls them from leftover.
        let mut got = dialed.lock().clone();
        got.sort();
        let mut want = vec![nid(1), nid(2)];
        want.sort();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn pex_request_triggers_advertisement_reply() {
        let (trans_a, rx_a, trans_b, rx_b) = InMemoryTransport::pair();
        let dialed_a = Arc::new(SyncMutex::new(Vec::new()));
        let dialed_b = Arc::new(SyncMutex::new(Vec::new()));

        let mgr_a = manager(nid(1), 1, dialed_a.clone());
        let mgr_b = ConnectionManager::new(
            nid(2),
            1,
            Box::new(|_peer: &PeerDto| true),
            Box::new(move |peer: PeerDto| {
                if let Some(id) = peer.peer_id() {
                    dialed_b.lock().push(id);
                }
            }),
            Box::new(|_max| vec![peer_dto(nid(3))]),
            Box::new(|ids: Vec<NodeId>| Box::pin(async move { ids }) as BoxFuture<'static, Vec<NodeId>>),
            Box::new(|| 0),
            EventSink::new(),
        );

        mgr_a.attach_pex_channel(nid(2), Arc::new(trans_a), rx_a);
        mgr_b.attach_pex_channel(nid(1), Arc::new(trans_b), rx_b);

        mgr_a.send_to(nid(2), &PexMessage::Request { max_number_of_peers: 3 }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        // the advertisement from b should have caused a's manager to
        // dial the one known peer (nid(3)).
        assert_eq!(*dialed_a.lock(), vec![nid(3)]);
    }
}
