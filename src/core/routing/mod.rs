//! K-bucket table (spec component B).
//!
//! Contacts carry only an id-based reference; the stream handle itself
//! is owned exclusively by the Link RPC (`crate::core::rpc`), per the
//! design note in spec.md §9 — this avoids cyclic ownership between
//! buckets and streams.

use linked_hash_map::LinkedHashMap;

use crate::core::identity::{NodeId, NUM_BUCKETS};

/// Default bucket capacity.
pub const DEFAULT_K: usize = 20;

/// A contact known to the routing table: an id, known by reference
/// only. Whether a live stream exists for it is a question for the
/// Link RPC, not the routing table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Contact {
    pub id: NodeId,
}

impl Contact {
    pub fn new(id: NodeId) -> Self {
        Contact { id }
    }
}

/// An LRU-ordered container of up to `k` contacts at a fixed
/// XOR-distance class.
#[derive(Debug)]
pub struct Bucket {
    capacity: usize,
    // insertion/LRU order lives in the map itself; no separate list.
    contacts: LinkedHashMap<NodeId, Contact>,
}

impl Bucket {
    fn new(capacity: usize) -> Self {
        Bucket {
            capacity,
            contacts: LinkedHashMap::new(),
        }
    }

    /// Inserts `contact`. A no-op if already present (per spec.md §3:
    /// "if the id is present, it is a no-op"). If full, evicts the
    /// least-recently-inserted entry before appending.
    fn add(&mut self, contact: Contact) {
        if self.contacts.contains_key(&contact.id) {
            return;
        }
        if self.contacts.len() >= self.capacity {
            self.contacts.pop_front();
        }
        self.contacts.insert(contact.id, contact);
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.contacts.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }
}

/// An array of [`NUM_BUCKETS`] buckets indexed by
/// `bucket_index(xor(self, id))`.
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        RoutingTable {
            self_id,
            k,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new(k)).collect(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Adds `contact` to its bucket. A no-op if `contact.id == self_id`
    /// (spec.md §4.B / boundary behavior in §8).
    pub fn add(&mut self, contact: Contact) {
        if contact.id == self.self_id {
            return;
        }
        let idx = self.self_id.xor(&contact.id).bucket_index();
        self.buckets[idx].add(contact);
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        if *id == self.self_id {
            return false;
        }
        let idx = self.self_id.xor(id).bucket_index();
        self.buckets[idx].contains(id)
    }

    /// Concatenation of all buckets.
    pub fn all(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|b| b.iter().copied()).collect()
    }

    /// The `k` closest contacts to `target`, sorted by ascending XOR
    /// distance, ties broken by lexicographic id compare. Returns an
    /// empty vector when the table is empty (boundary behavior, §8).
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Contact> {
        let mut scored: Vec<(crate::core::identity::Distance, Contact)> = self
            .all()
            .into_iter()
            .map(|c| (target.xor(&c.id), c))
            .collect();
        scored.sort_by(|(da, ca), (db, cb)| da.cmp(db).then_with(|| ca.id.cmp(&cb.id)));
        scored.into_iter().take(k).map(|(_, c)| c).collect()
    }

    /// Stable-sorts `ids` by ascending XOR distance to `self`.
    pub fn sort_closest_to_self(&self, mut ids: Vec<NodeId>) -> Vec<NodeId> {
        ids.sort_by_key(|id| self.self_id.xor(id));
        ids
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

    #[test]
    fn add_self_is_noop() {
        let mut t = RoutingTable::new(nid(0), DEFAULT_K);
        t.add(Contact::new(nid(0)));
        assert!(t.all().is_empty());
    }

    #[test]
    fn closest_on_empty_table_is_empty() {
        let t = RoutingTable::new(nid(0), DEFAULT_K);
        assert!(t.closest(&nid(1), 5).is_empty());
    }

    #[test]
    fn bucket_index_invariant_holds_for_every_contact() {
        let mut t = RoutingTable::new(nid(0), DEFAULT_K);
        for i in 1..=50u8 {
            t.add(Contact::new(nid(i)));
        }
        for (bucket_idx, bucket) in t.buckets.iter().enumerate() {
            for c in bucket.iter() {
                let d = t.self_id.xor(&c.id);
                assert_eq!(d.bucket_index(), bucket_idx);
            }
        }
    }

    #[test]
    fn bucket_capacity_is_respected() {
        let mut t = RoutingTable::new(nid(0), 3);
        // all of these collide into the same bucket (bit 0 of last byte)
        for i in 1..=3u8 {
            t.add(Contact::new(nid(i * 2 - 1)));
        }
        for bucket in &t.buckets {
            assert!(bucket.len() <= 3);
        }
    }

    #[test]
    fn lru_eviction_then_readd() {
        let mut b = Bucket::new(2);
        let a = Contact::new(nid(1));
        let c = Contact::new(nid(2));
        let d = Contact::new(nid(3));
        b.add(a);
        b.add(c);
        b.add(d); // evicts `a`
        assert!(!b.contains(&a.id));
        assert!(b.contains(&c.id));
        assert!(b.contains(&d.id));

        b.add(a); // re-adds at the tail, evicting `c`
        assert!(b.contains(&a.id));
        assert!(!b.contains(&c.id));
    }

    #[test]
    fn closest_sorted_ascending_with_id_tiebreak() {
        let mut t = RoutingTable::new(nid(0), DEFAULT_K);
        t.add(Contact::new(nid(4)));
        t.add(Contact::new(nid(2)));
        t.add(Contact::new(nid(6)));
        let closest = t.closest(&nid(0), 10);
        let ids: Vec<u8> = closest.iter().map(|c| c.id.as_bytes()[19]).collect();
        assert_eq!(ids, vec![2, 4, 6]);
    }
}
