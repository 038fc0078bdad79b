//! Identifier Keyspace and Distance Metric
//!
//! This module provides the two identifier types used by the routing table:
//! the opaque, caller-supplied [`PeerId`] and the derived 256-bit routing
//! identifier [`DhtKey`]. Routing identifiers are derived from peer
//! identifiers using BLAKE3 hashing and compared with the XOR distance
//! metric.

use blake3::Hasher;
use num_bigint::BigUint;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Opaque 256-bit peer identifier supplied by the host
///
/// The table never interprets the bytes; routing decisions are made on the
/// derived [`DhtKey`]. Hosts typically use a public key or a hash of one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Generate a random PeerId
    ///
    /// Primarily used for testing and simulation. Production hosts derive
    /// identifiers from cryptographic material.
    #[must_use]
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Create a PeerId from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the identifier
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// 256-bit routing identifier in the XOR keyspace
///
/// Derived from a [`PeerId`] by BLAKE3 hashing with domain separation, so
/// bucket placement is uniform even for adversarially chosen peer
/// identifiers. The XOR metric gives the symmetric, transitive notion of
/// distance Kademlia routing relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DhtKey([u8; 32]);

impl DhtKey {
    /// Number of bits in a DhtKey
    pub const BITS: u32 = 256;

    /// Derive the routing identifier for a peer
    ///
    /// Deterministic: the same peer always maps to the same key.
    ///
    /// # Examples
    ///
    /// ```
    /// use kadrtt_kbucket::{DhtKey, PeerId};
    ///
    /// let p = PeerId::random();
    /// assert_eq!(DhtKey::from_peer_id(&p), DhtKey::from_peer_id(&p));
    /// ```
    #[must_use]
    pub fn from_peer_id(peer: &PeerId) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(peer.as_bytes());
        hasher.update(b"kadrtt-dht-key"); // Domain separation
        let hash = hasher.finalize();
        Self(*hash.as_bytes())
    }

    /// Byte-wise XOR with another key
    #[must_use]
    pub fn xor(&self, other: &DhtKey) -> DhtKey {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        DhtKey(result)
    }

    /// Number of leading bits shared with another key
    ///
    /// Counts the leading zeros of the XOR; identical keys share all
    /// [`DhtKey::BITS`] bits.
    ///
    /// # Examples
    ///
    /// ```
    /// use kadrtt_kbucket::DhtKey;
    ///
    /// let a = DhtKey::from_bytes([0u8; 32]);
    /// let mut bytes = [0u8; 32];
    /// bytes[0] = 0b0001_0000;
    /// let b = DhtKey::from_bytes(bytes);
    /// assert_eq!(a.common_prefix_len(&b), 3);
    /// ```
    #[must_use]
    pub fn common_prefix_len(&self, other: &DhtKey) -> u32 {
        self.xor(other).leading_zeros()
    }

    /// XOR distance to another key as a nonnegative big integer
    ///
    /// Interprets the XOR big-endian. The integer form is what the
    /// variance-based eviction policy and the hybrid lookup ordering do
    /// arithmetic on; plain ordering comparisons can use the cheaper
    /// lexicographic [`Ord`] on the XOR bytes instead.
    #[must_use]
    pub fn distance(&self, other: &DhtKey) -> BigUint {
        BigUint::from_bytes_be(&self.xor(other).0)
    }

    /// Count leading zero bits
    #[must_use]
    pub fn leading_zeros(&self) -> u32 {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros();
                break;
            }
        }
        count.min(Self::BITS)
    }

    /// Get the raw bytes of the key
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a DhtKey from raw bytes
    ///
    /// Intended for hosts that manage their own keyspace (e.g. the local
    /// identifier passed at table construction) and for tests.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialOrd for DhtKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DhtKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// Helper module for hex encoding (simplified)
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_deterministic() {
        let p = PeerId::from_bytes([42u8; 32]);
        assert_eq!(DhtKey::from_peer_id(&p), DhtKey::from_peer_id(&p));
    }

    #[test]
    fn test_random_peer_ids_unique() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn test_xor_symmetry() {
        let a = DhtKey::from_peer_id(&PeerId::random());
        let b = DhtKey::from_peer_id(&PeerId::random());
        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn test_xor_identity() {
        let a = DhtKey::from_peer_id(&PeerId::random());
        assert_eq!(a.xor(&a), DhtKey::from_bytes([0u8; 32]));
    }

    #[test]
    fn test_distance_byte_values() {
        let a = DhtKey::from_bytes([1u8; 32]);
        let b = DhtKey::from_bytes([2u8; 32]);
        // 1 XOR 2 = 3 in every byte position
        assert_eq!(a.xor(&b).as_bytes(), &[3u8; 32]);
        assert_eq!(a.distance(&b), BigUint::from_bytes_be(&[3u8; 32]));
    }

    #[test]
    fn test_common_prefix_len() {
        let zero = DhtKey::from_bytes([0u8; 32]);

        let mut bytes = [0u8; 32];
        bytes[0] = 0b1000_0000;
        assert_eq!(zero.common_prefix_len(&DhtKey::from_bytes(bytes)), 0);

        let mut bytes = [0u8; 32];
        bytes[0] = 0b0000_0001;
        assert_eq!(zero.common_prefix_len(&DhtKey::from_bytes(bytes)), 7);

        let mut bytes = [0u8; 32];
        bytes[1] = 0b1000_0000;
        assert_eq!(zero.common_prefix_len(&DhtKey::from_bytes(bytes)), 8);

        // identical keys share all bits
        assert_eq!(zero.common_prefix_len(&zero), DhtKey::BITS);
    }

    #[test]
    fn test_distance_orders_like_bytes() {
        let target = DhtKey::from_bytes([0u8; 32]);
        let mut near = [0u8; 32];
        near[31] = 7;
        let mut far = [0u8; 32];
        far[0] = 1;
        let near = DhtKey::from_bytes(near);
        let far = DhtKey::from_bytes(far);
        assert!(target.distance(&near) < target.distance(&far));
        assert!(target.xor(&near) < target.xor(&far));
    }

    #[test]
    fn test_ordering() {
        let a = DhtKey::from_bytes([1u8; 32]);
        let b = DhtKey::from_bytes([2u8; 32]);
        assert!(a < b);
        assert!(b > a);
    }
}
