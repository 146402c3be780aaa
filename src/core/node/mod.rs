//! DHT Node (spec component F): composes the routing table, link RPC,
//! forwarding strategy, and message cache behind a single public API.

pub mod persistence;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::async_runtime::{self as rt, JoinHandle};
use crate::core::cache::{
    CacheStrategy, DistanceCache, DistanceProbabilisticCache, FindAndPing, SendCached,
    DEFAULT_MAX_TTL,
};
use crate::core::config::{timing, CacheStrategyKind, NodeConfig, MAX_RECEIVED_IDS};
use crate::core::error::Result;
use crate::core::events::{Event, EventSink};
use crate::core::forward::{self, ForwardedIds, PayloadKind};
use crate::core::identity::NodeId;
use crate::core::routing::{Contact, RoutingTable};
use crate::core::rpc::{Envelope, LinkRpc, RpcEvent, RpcMessage, RpcTransport};

pub use persistence::{FileStateStore, NullStateStore, StateStore};

/// External-collaborator context threaded through construction in place
/// of the source's global `userStore`/`privateKeyStore` singletons
/// (design note in spec.md §9). The cryptographic handshake and
/// envelope layer are out of this crate's scope (spec.md §1); `Peer`
/// is the seam a future collaborator attaches to, so adding it later
/// doesn't mean threading new global state through every call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct Peer;

/// Mutable state touched by every logical operation on a node:
/// the routing table and both dedup sets. Guarded by a single async
/// mutex so operations serialize the way spec.md §5 describes a node's
/// single logical task — network suspension points included.
struct NodeState {
    routing_table: RoutingTable,
    forwarded_ids: ForwardedIds,
    received_signaling_ids: ForwardedIds,
}

pub struct DhtNode {
    self_id: NodeId,
    k: usize,
    rpc: Arc<LinkRpc>,
    state: AsyncMutex<NodeState>,
    cache: AsyncMutex<Box<dyn CacheStrategy>>,
    events: EventSink,
    simulator_mode: bool,
    bootstrap_node_id: Option<NodeId>,
    min_connections: usize,
    state_store: Arc<dyn StateStore>,
    timers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl DhtNode {
    /// Builds a node and wires up its background tasks: the RPC event
    /// dispatcher, the dedup-set cleanup timer, and the cache-replay
    /// timer (spec.md §4.F, §5).
    pub fn new(
        _peer: Peer,
        config: NodeConfig,
        state_store: Arc<dyn StateStore>,
    ) -> (Arc<Self>, tokio::sync::broadcast::Receiver<Event>) {
        let self_id = config.node_id;
        let (rpc, rpc_events) = LinkRpc::new(self_id);
        let events = EventSink::new();
        let subscription = events.subscribe();

        let cache: Box<dyn CacheStrategy> = match config.cache_strategy {
            CacheStrategyKind::Distance => Box::new(DistanceCache::new(
                config.cache_size,
                config.cache_distance_threshold,
                events.clone(),
            )),
            CacheStrategyKind::DistanceProbabilistic => Box::new(DistanceProbabilisticCache::new(
                config.cache_size,
                config.cache_distance_threshold,
                config.cache_probability,
                events.clone(),
            )),
        };

        let node = Arc::new(DhtNode {
            self_id,
            k: config.k,
            rpc,
            state: AsyncMutex::new(NodeState {
                routing_table: RoutingTable::new(self_id, config.k),
                forwarded_ids: ForwardedIds::new(MAX_RECEIVED_IDS),
                received_signaling_ids: ForwardedIds::new(MAX_RECEIVED_IDS),
            }),
            cache: AsyncMutex::new(cache),
            events,
            simulator_mode: config.simulator_mode,
            bootstrap_node_id: config.bootstrap_node_id,
            min_connections: config.min_connections,
            state_store,
            timers: SyncMutex::new(Vec::new()),
        });

        node.spawn_event_dispatcher(rpc_events);
        node.spawn_timers();

        (node, subscription)
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// The bootstrap peer recorded at construction, if any. The
    /// connection layer is expected to dial it and hand the resulting
    /// transport to [`DhtNode::attach_peer`] (spec.md §6
    /// `bootstrapNodeId`).
    pub fn bootstrap_node_id(&self) -> Option<NodeId> {
        self.bootstrap_node_id
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Stable-sorts `ids` by ascending XOR distance to this node
    /// (spec.md §4.B `sort_closest_to_self`), used by the connection
    /// manager (spec.md §4.G) to pick the nearest open PEX channel.
    pub async fn sort_closest_to_self(&self, ids: Vec<NodeId>) -> Vec<NodeId> {
        self.state.lock().await.routing_table.sort_closest_to_self(ids)
    }

    /// Builds a [`crate::core::connection::ConnectionManager`] wired
    /// to this node's routing table, ready for the embedder to supply
    /// the remaining external collaborators: a connect filter, a dial
    /// callback, a known-peers provider (carries `publicKey`, which
    /// this crate never stores), and a connection-count accessor
    /// (spec.md §4.G, §9 "Global in-memory stores").
    pub fn connection_manager(
        self: &Arc<Self>,
        filter: crate::core::connection::ConnectFilter,
        dial: crate::core::connection::Dial,
        known_peers: crate::core::connection::KnownPeers,
        connection_count: crate::core::connection::ConnectionCount,
    ) -> Arc<crate::core::connection::ConnectionManager> {
        let this = self.clone();
        let sort_closest: crate::core::connection::SortClosestToSelf = Box::new(move |ids| {
            let this = this.clone();
            Box::pin(async move { this.sort_closest_to_self(ids).await })
        });
        crate::core::connection::ConnectionManager::new(
            self.self_id,
            self.min_connections,
            filter,
            dial,
            known_peers,
            sort_closest,
            connection_count,
            self.events.clone(),
        )
    }

    /// Installs a freshly connected transport for `node`. `add_node` and
    /// the `ready` liveness check run from the RPC's own `listening`
    /// event, matching spec.md §4.F's construction-time wiring.
    pub fn attach_peer(
        self: &Arc<Self>,
        node: NodeId,
        transport: Arc<dyn RpcTransport>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) {
        self.rpc.attach(node, transport, inbound);
    }

    fn spawn_event_dispatcher(self: &Arc<Self>, mut rx: crate::core::rpc::RpcEventRx) {
        let this = self.clone();
        let handle = rt::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    RpcEvent::Listening(node) => {
                        this.add_node(node).await;
                        this.try_deliver_cached().await;
                    }
                    RpcEvent::Ping(node) => {
                        this.add_node(node).await;
                    }
                    RpcEvent::Message(msg, from) => {
                        this.handle_message(msg, from).await;
                    }
                }
            }
        });
        self.timers.lock().push(handle);
    }

    fn spawn_timers(self: &Arc<Self>) {
        let cleanup = self.clone();
        let cleanup_handle = rt::spawn(async move {
            let mut interval = tokio::time::interval(timing::DEDUP_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let mut state = cleanup.state.lock().await;
                debug!(
                    forwarded = state.forwarded_ids.len(),
                    signaling = state.received_signaling_ids.len(),
                    "dedup cleanup tick"
                );
                // ForwardedIds already self-bounds on insert; this tick
                // exists to match the timer named in spec.md §5 and as a
                // seat for future additional pruning policy.
                let _ = &mut state;
            }
        });
        self.timers.lock().push(cleanup_handle);

        let replay = self.clone();
        let replay_handle = rt::spawn(async move {
            let mut interval = tokio::time::interval(timing::CACHE_REPLAY_INTERVAL);
            loop {
                interval.tick().await;
                replay.try_deliver_cached().await;
            }
        });
        self.timers.lock().push(replay_handle);
    }

    /// `add_node` from spec.md §4.F: adds unconditionally (idempotent
    /// per the routing table's own no-op-on-duplicate rule), then
    /// confirms liveness. In `simulator_mode`, liveness is assumed
    /// without pinging.
    pub async fn add_node(self: &Arc<Self>, node: NodeId) {
        if node == self.self_id {
            return;
        }
        let already_known = {
            let state = self.state.lock().await;
            state.routing_table.contains(&node)
        };
        if already_known {
            return;
        }
        {
            let mut state = self.state.lock().await;
            state.routing_table.add(Contact::new(node));
        }

        if self.simulator_mode {
            self.events.emit(Event::Ready(node));
            self.try_deliver_cached().await;
            return;
        }

        let this = self.clone();
        rt::spawn(async move {
            if this.rpc.ping(node).await {
                this.events.emit(Event::Ready(node));
                this.try_deliver_cached().await;
            }
        });
    }

    /// Sends a chat-message `payload` toward `recipient` (spec.md
    /// §4.F). Short-circuits to local delivery when `recipient` is this
    /// node's own id — a deliberate deviation from the reference
    /// source, which forwards to self (spec.md §9 open question).
    pub async fn send_message(self: &Arc<Self>, recipient: NodeId, mut payload: Envelope) -> Result<()> {
        payload.ensure_id();

        if recipient == self.self_id {
            self.events.emit(Event::ChatMessage(payload));
            return Ok(());
        }

        let sender = payload.sender_id().unwrap_or(self.self_id);
        let in_table = {
            let state = self.state.lock().await;
            state.routing_table.contains(&recipient)
        };

        if in_table {
            let delivered = self.send_direct_user(sender, recipient, &payload).await;
            if delivered {
                return Ok(());
            }
        }

        {
            let mut cache = self.cache.lock().await;
            cache.cache_message(sender, recipient, payload.clone(), self.self_id, in_table);
        }
        self.events.emit(Event::Cache { recipient });

        let mut state = self.state.lock().await;
        let state = &mut *state;
        forward::forward(
            sender,
            recipient,
            &payload,
            PayloadKind::UserMessage,
            &state.routing_table,
            &self.rpc,
            self.k,
            self.self_id,
            &mut state.forwarded_ids,
            in_table,
            &self.events,
        )
        .await
    }

    async fn send_direct_user(&self, sender: NodeId, recipient: NodeId, payload: &Envelope) -> bool {
        if !self.rpc.ping(recipient).await {
            return false;
        }
        let msg = RpcMessage::UserMessage {
            sender,
            recipient,
            message: payload.clone(),
            signaling_message: None,
        };
        let ok = self.rpc.send(recipient, &msg).await;
        if ok {
            self.events.emit(Event::Sent { to: recipient });
        }
        ok
    }

    /// Sends a signaling envelope toward `recipient`. `sender` is only
    /// set by re-dispatch from [`DhtNode::handle_message`]; a node
    /// originating its own signaling passes `None` and becomes the
    /// `is_origin` forwarder of record. Signaling is never cached
    /// (spec.md §4.F).
    pub async fn send_signaling(
        self: &Arc<Self>,
        recipient: NodeId,
        mut signaling: Envelope,
        sender: Option<NodeId>,
    ) -> Result<()> {
        let (sender, is_origin) = match sender {
            Some(s) => (s, false),
            None => (self.self_id, true),
        };
        signaling.ensure_id();

        if recipient == self.self_id {
            self.events.emit(Event::SignalingMessage(signaling));
            return Ok(());
        }

        let in_table = {
            let state = self.state.lock().await;
            state.routing_table.contains(&recipient)
        };

        if in_table {
            let delivered = if self.rpc.ping(recipient).await {
                let msg = RpcMessage::Signaling {
                    sender,
                    recipient,
                    message: None,
                    signaling_message: signaling.clone(),
                };
                let ok = self.rpc.send(recipient, &msg).await;
                if ok {
                    self.events.emit(Event::Sent { to: recipient });
                }
                ok
            } else {
                false
            };

            if delivered {
                if is_origin {
                    if let Some(id) = signaling.id() {
                        self.state.lock().await.forwarded_ids.insert(id);
                    }
                }
                return Ok(());
            }
        }

        let mut state = self.state.lock().await;
        let state = &mut *state;
        forward::forward(
            sender,
            recipient,
            &signaling,
            PayloadKind::Signaling,
            &state.routing_table,
            &self.rpc,
            self.k,
            self.self_id,
            &mut state.forwarded_ids,
            in_table,
            &self.events,
        )
        .await
    }

    /// Dispatches an inbound RPC message (spec.md §4.F). Frames without
    /// a recipient (ping/pong) never reach here — the link RPC resolves
    /// those itself.
    async fn handle_message(self: &Arc<Self>, msg: RpcMessage, from: NodeId) {
        let recipient = match msg.recipient() {
            Some(r) => r,
            None => return,
        };
        let payload = match msg.payload() {
            Some(p) if p.id().is_some() => p.clone(),
            _ => {
                warn!(peer = %from, "dropping message with no envelope id");
                return;
            }
        };
        let sender = msg.sender();

        self.add_node(from).await;

        match msg {
            RpcMessage::UserMessage { .. } => {
                if recipient == self.self_id {
                    self.events.emit(Event::ChatMessage(payload));
                } else if let Err(e) = self.send_message(recipient, payload).await {
                    warn!(error = %e, "re-dispatch of user message failed");
                }
            }
            RpcMessage::Signaling { .. } => {
                let sig_id = match payload.id() {
                    Some(id) => id,
                    None => return,
                };
                let duplicate = {
                    let mut state = self.state.lock().await;
                    if state.received_signaling_ids.contains(&sig_id) {
                        true
                    } else {
                        state.received_signaling_ids.insert(sig_id);
                        false
                    }
                };
                if duplicate {
                    debug!(%sig_id, "dropping duplicate signaling message");
                    return;
                }
                if recipient == self.self_id {
                    self.events.emit(Event::SignalingMessage(payload));
                } else if let Err(e) = self.send_signaling(recipient, payload, Some(sender)).await {
                    warn!(error = %e, "re-dispatch of signaling message failed");
                }
            }
            RpcMessage::Ping { .. } | RpcMessage::Pong { .. } => {}
        }
    }

    /// Sweeps the cache once: expires stale entries and retries
    /// delivery of the rest (spec.md §4.E/§4.F).
    async fn try_deliver_cached(self: &Arc<Self>) {
        let now = now_millis();

        let this_a = self.clone();
        let find_and_ping = move |recipient: NodeId| -> BoxFuture<'static, Option<NodeId>> {
            let this = this_a.clone();
            Box::pin(async move {
                if this.rpc.is_connected(&recipient) {
                    return Some(recipient);
                }
                let known = { this.state.lock().await.routing_table.contains(&recipient) };
                if known && this.rpc.ping(recipient).await {
                    Some(recipient)
                } else {
                    None
                }
            })
        };

        let this_b = self.clone();
        let send = move |target: NodeId, sender: NodeId, recipient: NodeId, payload: Envelope| -> BoxFuture<'static, bool> {
            let this = this_b.clone();
            Box::pin(async move {
                let msg = RpcMessage::UserMessage {
                    sender,
                    recipient,
                    message: payload,
                    signaling_message: None,
                };
                this.rpc.send(target, &msg).await
            })
        };

        let find_and_ping_ref: FindAndPing = &find_and_ping;
        let send_ref: SendCached = &send;

        let mut cache = self.cache.lock().await;
        let removed = cache
            .try_deliver(find_and_ping_ref, send_ref, DEFAULT_MAX_TTL, now)
            .await;
        if removed > 0 {
            debug!(removed, "cache replay pass complete");
        }
    }

    /// Persists the cache snapshot and routing-table ids (spec.md §6
    /// "Persisted state"). Runs the blocking file I/O off the async
    /// runtime's worker threads.
    pub async fn save_state(self: &Arc<Self>) -> Result<()> {
        let snapshot = { self.cache.lock().await.snapshot() };
        let routing_ids = {
            let state = self.state.lock().await;
            state.routing_table.all().into_iter().map(|c| c.id).collect::<Vec<_>>()
        };
        let store = self.state_store.clone();
        let self_id = self.self_id;
        tokio::task::spawn_blocking(move || {
            store.save_cache(self_id, &snapshot)?;
            store.save_routing_ids(self_id, &routing_ids)
        })
        .await
        .map_err(|e| crate::core::error::Error::PersistenceError(e.to_string()))??;
        Ok(())
    }

    /// Restores persisted state, if any (missing files are not
    /// errors). Routing-table ids are re-added without a liveness ping
    /// (spec.md §4.F).
    pub async fn load_state(self: &Arc<Self>) -> Result<()> {
        let store = self.state_store.clone();
        let self_id = self.self_id;
        let (cache_snapshot, routing_ids) = tokio::task::spawn_blocking(move || {
            let cache = store.load_cache(self_id)?;
            let ids = store.load_routing_ids(self_id)?;
            crate::core::error::Result::Ok((cache, ids))
        })
        .await
        .map_err(|e| crate::core::error::Error::PersistenceError(e.to_string()))??;

        if let Some(entries) = cache_snapshot {
            self.cache.lock().await.bulk_load(entries)?;
        }
        if let Some(ids) = routing_ids {
            let mut state = self.state.lock().await;
            for id in ids {
                state.routing_table.add(Contact::new(id));
            }
        }
        Ok(())
    }

    /// Tears the node down: cancels timers, closes every stream, and
    /// clears in-memory state (spec.md §5 "Cancellation").
    pub async fn close(&self) {
        self.rpc.close();
        for handle in self.timers.lock().drain(..) {
            handle.abort();
        }
        {
            let mut state = self.state.lock().await;
            state.routing_table = RoutingTable::new(self.self_id, self.k);
            state.forwarded_ids = ForwardedIds::new(MAX_RECEIVED_IDS);
            state.received_signaling_ids = ForwardedIds::new(MAX_RECEIVED_IDS);
        }
        self.cache.lock().await.clear();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
