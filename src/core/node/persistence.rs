//! State persistence (spec.md §4.F, §6 "Persisted state").
//!
//! One file per node per store, named after the node's hex id. Missing
//! files are not errors — a fresh node simply starts with empty state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::cache::CachedEntry;
use crate::core::error::Result;
use crate::core::identity::NodeId;

/// On-disk shape of one routing-table entry: `{"id": <hex20>}` (spec.md
/// §6 persisted-state format), not a bare hex string.
#[derive(Serialize, Deserialize)]
struct PersistedContact {
    id: NodeId,
}

/// Where cache and routing-table snapshots are read from and written to.
///
/// A trait rather than a single `FileStateStore` so embedders can swap
/// in e.g. a browser `IndexedDB`-backed store without touching
/// [`crate::core::node::DhtNode`].
pub trait StateStore: Send + Sync {
    fn save_cache(&self, self_id: NodeId, entries: &[(Uuid, CachedEntry)]) -> Result<()>;
    fn load_cache(&self, self_id: NodeId) -> Result<Option<Vec<(Uuid, CachedEntry)>>>;
    fn save_routing_ids(&self, self_id: NodeId, ids: &[NodeId]) -> Result<()>;
    fn load_routing_ids(&self, self_id: NodeId) -> Result<Option<Vec<NodeId>>>;
}

/// Default [`StateStore`]: two JSON files per node under `base_dir`,
/// named `dht_<self_id>_cachedMessages.json` and
/// `dht_<self_id>_kBucket.json` (spec.md §6).
pub struct FileStateStore {
    base_dir: PathBuf,
}

impl FileStateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FileStateStore {
            base_dir: base_dir.into(),
        }
    }

    fn cache_path(&self, self_id: NodeId) -> PathBuf {
        self.base_dir
            .join(format!("dht_{}_cachedMessages.json", self_id.to_hex()))
    }

    fn routing_path(&self, self_id: NodeId) -> PathBuf {
        self.base_dir
            .join(format!("dht_{}_kBucket.json", self_id.to_hex()))
    }

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(value)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl StateStore for FileStateStore {
    fn save_cache(&self, self_id: NodeId, entries: &[(Uuid, CachedEntry)]) -> Result<()> {
        Self::write_json(&self.cache_path(self_id), &entries)
    }

    fn load_cache(&self, self_id: NodeId) -> Result<Option<Vec<(Uuid, CachedEntry)>>> {
        Self::read_json(&self.cache_path(self_id))
    }

    fn save_routing_ids(&self, self_id: NodeId, ids: &[NodeId]) -> Result<()> {
        let contacts: Vec<PersistedContact> = ids.iter().map(|id| PersistedContact { id: *id }).collect();
        Self::write_json(&self.routing_path(self_id), &contacts)
    }

    fn load_routing_ids(&self, self_id: NodeId) -> Result<Option<Vec<NodeId>>> {
        let contacts: Option<Vec<PersistedContact>> = Self::read_json(&self.routing_path(self_id))?;
        Ok(contacts.map(|cs| cs.into_iter().map(|c| c.id).collect()))
    }
}

/// A [`StateStore`] that keeps nothing, for embedders that don't want
/// persistence (e.g. the in-process simulator).
pub struct NullStateStore;

impl StateStore for NullStateStore {
    fn save_cache(&self, _self_id: NodeId, _entries: &[(Uuid, CachedEntry)]) -> Result<()> {
        Ok(())
    }

    fn load_cache(&self, _self_id: NodeId) -> Result<Option<Vec<(Uuid, CachedEntry)>>> {
        Ok(None)
    }

    fn save_routing_ids(&self, _self_id: NodeId, _ids: &[NodeId]) -> Result<()> {
        Ok(())
    }

    fn load_routing_ids(&self, _self_id: NodeId) -> Result<Option<Vec<NodeId>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::core::rpc::Envelope;

    fn nid(b: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = b;
        NodeId::from_bytes(&bytes).unwrap()
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("dht-core-test-state").join(name);
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn missing_files_load_as_none() {
        let store = FileStateStore::new(scratch_dir("missing"));
        assert!(store.load_cache(nid(1)).unwrap().is_none());
        assert!(store.load_routing_ids(nid(1)).unwrap().is_none());
    }

    #[test]
    fn cache_and_routing_round_trip() {
        let dir = scratch_dir("round-trip");
        let store = FileStateStore::new(&dir);
        let id = nid(1);

        let entry = CachedEntry {
            sender: nid(2),
            recipient: nid(3),
            payload: Envelope::new(json!({ "id": Uuid::new_v4().to_string(), "timestamp": 1u64 })),
            inserted_at: 1,
        };
        let entries = vec![(Uuid::new_v4(), entry)];
        store.save_cache(id, &entries).unwrap();
        let loaded = store.load_cache(id).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);

        let ids = vec![nid(4), nid(5)];
        store.save_routing_ids(id, &ids).unwrap();
        let loaded_ids = store.load_routing_ids(id).unwrap().unwrap();
        assert_eq!(loaded_ids, ids);

        let _ = fs::remove_dir_all(&dir);
    }
}
