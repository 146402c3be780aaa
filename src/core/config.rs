//! Recognized configuration options (spec.md §6).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::cache::{
    DEFAULT_CACHE_PROBABILITY, DEFAULT_DISTANCE_THRESHOLD, DEFAULT_MAX_SIZE,
};
use crate::core::identity::NodeId;
use crate::core::routing::DEFAULT_K;

/// Which [`crate::core::cache::CacheStrategy`] implementation to build.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategyKind {
    Distance,
    DistanceProbabilistic,
}

impl Default for CacheStrategyKind {
    fn default() -> Self {
        CacheStrategyKind::Distance
    }
}

/// Construction-time configuration for a [`crate::core::node::DhtNode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Required self identifier.
    pub node_id: NodeId,
    /// Bucket capacity.
    #[serde(default = "default_k")]
    pub k: usize,
    /// If present, added and pinged on init.
    #[serde(default)]
    pub bootstrap_node_id: Option<NodeId>,
    #[serde(default)]
    pub cache_strategy: CacheStrategyKind,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_cache_distance_threshold")]
    pub cache_distance_threshold: u64,
    #[serde(default = "default_cache_probability")]
    pub cache_probability: f64,
    /// Skips the liveness ping in `add_node` and treats new contacts as
    /// immediately live — a configuration switch present in the
    /// reference source for deterministic simulation/testing, per
    /// spec.md §4.F.
    #[serde(default)]
    pub simulator_mode: bool,
    /// Minimum number of connected peers the connection manager tries
    /// to maintain (spec.md §4.G).
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
}

impl NodeConfig {
    pub fn new(node_id: NodeId) -> Self {
        NodeConfig {
            node_id,
            k: default_k(),
            bootstrap_node_id: None,
            cache_strategy: CacheStrategyKind::default(),
            cache_size: default_cache_size(),
            cache_distance_threshold: default_cache_distance_threshold(),
            cache_probability: default_cache_probability(),
            simulator_mode: false,
            min_connections: default_min_connections(),
        }
    }
}

fn default_k() -> usize {
    DEFAULT_K
}

fn default_cache_size() -> usize {
    DEFAULT_MAX_SIZE
}

fn default_cache_distance_threshold() -> u64 {
    DEFAULT_DISTANCE_THRESHOLD
}

fn default_cache_probability() -> f64 {
    DEFAULT_CACHE_PROBABILITY
}

fn default_min_connections() -> usize {
    4
}

/// Timing constants from spec.md §5.
pub mod timing {
    use super::Duration;

    pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CACHE_TTL: Duration = Duration::from_secs(48 * 60 * 60);
    pub const DEDUP_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
    pub const CACHE_REPLAY_INTERVAL: Duration = Duration::from_secs(5 * 60);
    pub const PEX_INITIAL_DELAY: Duration = Duration::from_secs(2);
    pub const PEX_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
}

/// Cap on `forwarded_ids`/`received_signaling_ids` (spec.md §3).
pub const MAX_RECEIVED_IDS: usize = 10_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = NodeConfig::new(NodeId::from_bytes(&[0u8; 20]).unwrap());
        assert_eq!(cfg.k, 20);
        assert_eq!(cfg.cache_distance_threshold, 1 << 45);
        assert!((cfg.cache_probability - 0.7).abs() < f64::EPSILON);
    }
}
