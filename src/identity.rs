//! # Node Identity and Ring Arithmetic
//!
//! This module defines the core identity types used throughout veilring:
//!
//! - [`NodeId`]: 32-byte position on the circular identifier space
//! - [`PeerInfo`]: wire-level peer record (identity + transport address)
//!
//! ## Identity Model
//!
//! A node's identity is the BLAKE3 hash of its stable onion-style transport
//! address. Because the address is assigned by the anonymization layer and is
//! stable across restarts, any peer can derive (and check) another peer's
//! ring position from its address alone.
//!
//! ## Ring Arithmetic
//!
//! Identifiers live on a ring of size 2^256, ordered big-endian. All interval
//! checks are clockwise:
//!
//! - `in_open_interval(id, a, b)`: id strictly between a and b going clockwise
//! - `in_open_closed_interval(id, a, b)`: same, but b itself is included
//! - `distance_clockwise(a, b)`: hops from a forward to b, mod 2^256
//!
//! Finger table targets are computed with [`NodeId::add_power_of_two`]:
//! entry *i* targets `self + 2^i (mod 2^256)`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Domain separation prefix when hashing a transport address into a NodeId.
/// Prevents cross-use of the same hash for addresses and data keys.
const ADDR_HASH_DOMAIN: &[u8] = b"veilring-node-v1:";

/// Domain separation prefix when hashing a data key into the identifier space.
const KEY_HASH_DOMAIN: &[u8] = b"veilring-key-v1:";

/// Number of bits in the identifier space; also the finger table size.
pub const RING_BITS: usize = 256;

/// Returns current time as milliseconds since Unix epoch.
/// Used for record versions and message timestamps.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A position on the 2^256 identifier ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Derive the ring position for a node from its stable transport address.
    pub fn from_addr(addr: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ADDR_HASH_DOMAIN);
        hasher.update(addr.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Hash an application key into the identifier space.
    pub fn from_key(key: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KEY_HASH_DOMAIN);
        hasher.update(key);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// `self + 2^exp (mod 2^256)`, the target of finger table entry `exp`.
    ///
    /// Byte 31 is least significant (big-endian ordering), so bit `exp` lives
    /// in byte `31 - exp / 8`; the carry propagates toward byte 0 and wraps
    /// silently past it.
    pub fn add_power_of_two(&self, exp: usize) -> Self {
        debug_assert!(exp < RING_BITS);
        let mut out = self.0;
        let byte_idx = 31 - exp / 8;
        let mut carry = 1u8 << (exp % 8);
        let mut i = byte_idx as isize;
        while carry != 0 && i >= 0 {
            let (sum, overflow) = out[i as usize].overflowing_add(carry);
            out[i as usize] = sum;
            carry = if overflow { 1 } else { 0 };
            i -= 1;
        }
        Self(out)
    }

    /// Clockwise distance from `self` forward to `other`, mod 2^256.
    pub fn distance_clockwise(&self, other: &NodeId) -> [u8; 32] {
        // other - self, byte-wise with borrow, big-endian
        let mut out = [0u8; 32];
        let mut borrow = 0u16;
        for i in (0..32).rev() {
            let a = other.0[i] as u16;
            let b = self.0[i] as u16 + borrow;
            if a >= b {
                out[i] = (a - b) as u8;
                borrow = 0;
            } else {
                out[i] = (a + 256 - b) as u8;
                borrow = 1;
            }
        }
        out
    }
}

/// True when `id` lies strictly between `start` and `end` going clockwise.
///
/// When `start == end` the interval is the whole ring minus the endpoint
/// itself (a node whose successor is itself precedes every other id).
pub fn in_open_interval(id: &NodeId, start: &NodeId, end: &NodeId) -> bool {
    if start == end {
        return id != start;
    }
    if start < end {
        start < id && id < end
    } else {
        id > start || id < end
    }
}

/// True when `id` lies in the clockwise interval `(start, end]`.
///
/// This is the key-ownership check: node `end` with predecessor `start` owns
/// exactly the ids for which this returns true. When `start == end` the node
/// is alone on the ring and owns everything.
pub fn in_open_closed_interval(id: &NodeId, start: &NodeId, end: &NodeId) -> bool {
    if start == end {
        return true;
    }
    if start < end {
        start < id && id <= end
    } else {
        id > start || id <= end
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; 32] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Wire-level peer record: ring position plus the transport address it was
/// derived from. Every protocol request carries the sender's `PeerInfo` so
/// the receiving registry can track liveness.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub addr: String,
    /// Milliseconds since epoch when this record was produced.
    pub timestamp: u64,
}

impl PeerInfo {
    /// Build a record for the given address, deriving the ring position.
    pub fn from_addr(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            id: NodeId::from_addr(&addr),
            addr,
            timestamp: now_ms(),
        }
    }

    /// Check that the claimed identity matches the claimed address.
    /// Records failing this are advertising an id they do not own.
    pub fn is_consistent(&self) -> bool {
        NodeId::from_addr(&self.addr) == self.id
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerInfo {}
