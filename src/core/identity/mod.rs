//! Identifier & distance (spec component A).
//!
//! `NodeId` is treated as an opaque 160-bit identifier derived by an
//! external crypto collaborator (SHA-1 of a public key, in the
//! reference source). This crate never constructs one from key
//! material; it only compares, XORs, and (de)serializes them.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Length, in bytes, of a `NodeId` (160 bits).
pub const ID_LEN: usize = 20;

/// Number of buckets in a [`crate::core::routing::RoutingTable`], one
/// per bit of a [`NodeId`].
pub const NUM_BUCKETS: usize = ID_LEN * 8;

/// A 160-bit opaque identifier.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// Builds a `NodeId` from a 20-byte slice.
    ///
    /// Fails with [`Error::InvalidId`] if `bytes.len() != 20`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ID_LEN {
            return Err(Error::InvalidId(bytes.len()));
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(NodeId(id))
    }

    /// The identifier's raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Bytewise XOR of two identifiers — the Kademlia distance metric.
    pub fn xor(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex_decode(s).map_err(|_| Error::InvalidId(s.len() / 2))?;
        NodeId::from_bytes(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        NodeId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// An unsigned 160-bit quantity: the XOR distance between two
/// [`NodeId`]s. Comparison is big-endian lexicographic on bytes, which
/// is equivalent to unsigned integer compare.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LEN]);

    /// Position of the highest-order set bit (0 = MSB of byte 0).
    /// The all-zero distance (self) maps to bucket 0 by convention,
    /// though it is never actually stored (the self-id invariant in
    /// spec.md §3).
    pub fn bucket_index(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit_idx = byte.leading_zeros() as usize;
                return byte_idx * 8 + bit_idx;
            }
        }
        0
    }

    /// Truncates the distance to its 48 most-significant bits,
    /// returned as a `u64` (used by the distance-bounded cache, spec
    /// §4.E).
    pub fn truncated_48(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..8].copy_from_slice(&self.0[0..6]);
        u64::from_be_bytes(buf)
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn hex_decode(s: &str) -> std::result::Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - 1] = b;
        NodeId(bytes)
    }

    #[test]
    fn xor_symmetry() {
        let a = id(5);
        let b = id(9);
        assert_eq!(a.xor(&b).0, b.xor(&a).0);
    }

    #[test]
    fn xor_self_is_zero() {
        let a = id(42);
        assert_eq!(a.xor(&a), Distance::ZERO);
    }

    #[test]
    fn bucket_index_of_zero_is_zero() {
        assert_eq!(Distance::ZERO.bucket_index(), 0);
    }

    #[test]
    fn bucket_index_matches_highest_set_bit() {
        let a = id(0b0000_0001);
        let b = id(0b0000_0000);
        // distance is 0...0001 -> highest set bit is bit 0 of the last byte
        assert_eq!(a.xor(&b).bucket_index(), NUM_BUCKETS - 1);

        let mut hi = [0u8; ID_LEN];
        hi[0] = 0b1000_0000;
        let c = NodeId(hi);
        let d = NodeId([0u8; ID_LEN]);
        assert_eq!(c.xor(&d).bucket_index(), 0);
    }

    #[test]
    fn invalid_length_is_rejected() {
        assert!(NodeId::from_bytes(&[0u8; 19]).is_err());
        assert!(NodeId::from_bytes(&[0u8; 21]).is_err());
    }

    #[test]
    fn hex_round_trip() {
        let a = id(0xab);
        let s = a.to_hex();
        let b: NodeId = s.parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distance_compare_is_unsigned_big_endian() {
        let small = id(1);
        let big = id(2);
        let zero = id(0);
        assert!(small.xor(&zero) < big.xor(&zero));
    }
}
