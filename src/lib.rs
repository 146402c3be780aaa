//! `dht-core`: a Kademlia-style routing overlay and store-and-forward
//! message cache for a browserless WebRTC chat/matchmaking mesh.
//!
//! This crate implements the eight components described in the
//! design spec it was built against: the XOR-metric k-bucket routing
//! table, the per-link RPC protocol, the forwarding strategy, the
//! distance-bounded message cache, the composing `DhtNode`, the PEX
//! connection manager, and a typed event sink. The cryptographic
//! handshake, the WebRTC session layer itself, and the UI/event-log
//! sink's final consumer are external collaborators; this crate
//! defines the seams (`RpcTransport`, `StateStore`, the PEX filter and
//! dial callbacks) those collaborators plug into.

pub mod core;

pub use crate::core::cache::{CacheStrategy, CachedEntry, DistanceCache, DistanceProbabilisticCache};
pub use crate::core::config::{CacheStrategyKind, NodeConfig};
pub use crate::core::connection::{ConnectionManager, PeerDto, PexMessage};
pub use crate::core::error::{Error, Result};
pub use crate::core::events::{Event, EventSink};
pub use crate::core::identity::{Distance, NodeId};
pub use crate::core::node::{DhtNode, FileStateStore, NullStateStore, Peer, StateStore};
pub use crate::core::routing::{Contact, RoutingTable};
pub use crate::core::rpc::{Envelope, InMemoryTransport, RpcMessage, RpcTransport};
