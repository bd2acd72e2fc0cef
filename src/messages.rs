//! # Wire Protocol Messages
//!
//! This module defines all serializable message types used on veilring's wire
//! protocol. Messages are serialized using bincode with size limits to prevent
//! memory exhaustion from malformed or hostile frames.
//!
//! ## Message Categories
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`RingRequest`] | Ring maintenance, storage, and broadcast requests |
//! | [`RingResponse`] | Responses paired with the request on the same stream |
//! | [`KeyRecord`] | A versioned key/value pair stored in the overlay |
//! | [`Message`] | An application broadcast payload |
//!
//! Every request carries the sender's [`PeerInfo`] so receivers can feed their
//! peer registry without a separate discovery exchange.

use crate::identity::{now_ms, NodeId, PeerInfo};
use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Maximum size of a stored value in bytes.
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

/// Maximum size of a single wire frame (length prefix excluded).
/// Transfer batches are the largest frames; they are chunked below this.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Bincode options shared by all wire serialization. The limit bounds
/// allocation during deserialization of untrusted input.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_SIZE as u64)
}

/// Serialize a request for the wire.
pub fn serialize_request(req: &RingRequest) -> Result<Vec<u8>> {
    bincode_options()
        .serialize(req)
        .context("failed to serialize request")
}

/// Serialize a response for the wire.
pub fn serialize_response(resp: &RingResponse) -> Result<Vec<u8>> {
    bincode_options()
        .serialize(resp)
        .context("failed to serialize response")
}

/// Deserialize untrusted bytes with bounded allocation.
pub fn deserialize_bounded<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    bincode_options()
        .deserialize(bytes)
        .context("failed to deserialize message")
}

/// A versioned key/value record. Versions are writer-side timestamps;
/// conflicts resolve last-writer-wins with the origin id as tiebreak.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: NodeId,
    pub value: Vec<u8>,
    pub version: u64,
    pub origin: NodeId,
}

impl KeyRecord {
    pub fn new(key: NodeId, value: Vec<u8>, origin: NodeId) -> Self {
        Self {
            key,
            value,
            version: now_ms(),
            origin,
        }
    }

    /// True when `self` should replace `other` under last-writer-wins.
    pub fn supersedes(&self, other: &KeyRecord) -> bool {
        (self.version, &self.origin) > (other.version, &other.origin)
    }
}

/// Identifier of a broadcast message, used for duplicate suppression.
pub type MessageId = [u8; 32];

/// An application-level broadcast payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub username: String,
    pub body: String,
    /// Milliseconds since epoch at the origin node.
    pub timestamp: u64,
    pub origin: NodeId,
}

impl Message {
    pub fn new(username: impl Into<String>, body: impl Into<String>, origin: NodeId) -> Self {
        Self {
            username: username.into(),
            body: body.into(),
            timestamp: now_ms(),
            origin,
        }
    }

    /// Content-derived id used to suppress re-delivery of forwarded copies.
    pub fn message_id(&self) -> MessageId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.origin.as_bytes());
        hasher.update(&self.timestamp.to_be_bytes());
        hasher.update(self.username.as_bytes());
        hasher.update(self.body.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// Requests understood by every node. Each carries the sender's identity so
/// the receiver can update its registry and, for broadcasts, avoid echoing
/// the message back to where it came from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RingRequest {
    /// Who is responsible for `id`? Answered with `Found` or `Redirect`.
    FindSuccessor { from: PeerInfo, id: NodeId },
    /// Stabilization probe: return your current predecessor.
    GetPredecessor { from: PeerInfo },
    /// "I believe I am your predecessor."
    Notify { from: PeerInfo },
    /// Liveness probe.
    Ping { from: PeerInfo },
    /// Store a record at the receiving node.
    Put { from: PeerInfo, record: KeyRecord },
    /// Fetch a record from the receiving node.
    Get { from: PeerInfo, key: NodeId },
    /// Remove a record from the receiving node.
    Delete { from: PeerInfo, key: NodeId },
    /// Bulk handoff of records the sender no longer owns.
    Transfer { from: PeerInfo, records: Vec<KeyRecord> },
    /// Flood-forwarded application message.
    Broadcast { from: PeerInfo, message: Message },
}

impl RingRequest {
    /// The peer record of whoever sent this request.
    pub fn sender(&self) -> &PeerInfo {
        match self {
            RingRequest::FindSuccessor { from, .. }
            | RingRequest::GetPredecessor { from }
            | RingRequest::Notify { from }
            | RingRequest::Ping { from }
            | RingRequest::Put { from, .. }
            | RingRequest::Get { from, .. }
            | RingRequest::Delete { from, .. }
            | RingRequest::Transfer { from, .. }
            | RingRequest::Broadcast { from, .. } => from,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RingRequest::FindSuccessor { .. } => "find_successor",
            RingRequest::GetPredecessor { .. } => "get_predecessor",
            RingRequest::Notify { .. } => "notify",
            RingRequest::Ping { .. } => "ping",
            RingRequest::Put { .. } => "put",
            RingRequest::Get { .. } => "get",
            RingRequest::Delete { .. } => "delete",
            RingRequest::Transfer { .. } => "transfer",
            RingRequest::Broadcast { .. } => "broadcast",
        }
    }
}

/// Responses paired one-to-one with [`RingRequest`]s on the same stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RingResponse {
    /// The queried node knows the owner of the id.
    Found(PeerInfo),
    /// The queried node does not own the id; ask this closer peer instead.
    Redirect(PeerInfo),
    /// Reply to `GetPredecessor`; `None` when the node has no predecessor yet.
    Predecessor(Option<PeerInfo>),
    /// Generic success for notify, ping, put, transfer, broadcast.
    Ack,
    /// Reply to `Get`.
    Value(Option<KeyRecord>),
    /// Reply to `Delete`: the value that was removed, if any.
    Previous(Option<Vec<u8>>),
    /// The receiver could not process the request.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str) -> PeerInfo {
        PeerInfo::from_addr(addr)
    }

    #[test]
    fn request_round_trips_through_wire_format() {
        let from = peer("alpha.onion:9000");
        let req = RingRequest::FindSuccessor {
            from: from.clone(),
            id: NodeId::from_key(b"some-key"),
        };
        let bytes = serialize_request(&req).unwrap();
        let back: RingRequest = deserialize_bounded(&bytes).unwrap();
        assert_eq!(back.sender().id, from.id);
        assert_eq!(back.kind(), "find_successor");
    }

    #[test]
    fn response_round_trips_through_wire_format() {
        let resp = RingResponse::Value(Some(KeyRecord::new(
            NodeId::from_key(b"k"),
            b"v".to_vec(),
            NodeId::from_addr("alpha.onion:9000"),
        )));
        let bytes = serialize_response(&resp).unwrap();
        let back: RingResponse = deserialize_bounded(&bytes).unwrap();
        match back {
            RingResponse::Value(Some(rec)) => assert_eq!(rec.value, b"v"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        let garbage = vec![0xffu8; 64];
        assert!(deserialize_bounded::<RingRequest>(&garbage).is_err());
        assert!(deserialize_bounded::<RingResponse>(&[]).is_err());
    }

    #[test]
    fn sender_is_exposed_for_every_variant() {
        let from = peer("alpha.onion:9000");
        let reqs = vec![
            RingRequest::GetPredecessor { from: from.clone() },
            RingRequest::Notify { from: from.clone() },
            RingRequest::Ping { from: from.clone() },
            RingRequest::Get {
                from: from.clone(),
                key: NodeId::from_key(b"k"),
            },
            RingRequest::Delete {
                from: from.clone(),
                key: NodeId::from_key(b"k"),
            },
            RingRequest::Transfer {
                from: from.clone(),
                records: vec![],
            },
        ];
        for req in reqs {
            assert_eq!(req.sender().id, from.id);
        }
    }

    #[test]
    fn newer_version_supersedes() {
        let origin = NodeId::from_addr("alpha.onion:9000");
        let key = NodeId::from_key(b"k");
        let older = KeyRecord {
            key,
            value: b"old".to_vec(),
            version: 100,
            origin,
        };
        let newer = KeyRecord {
            key,
            value: b"new".to_vec(),
            version: 200,
            origin,
        };
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        // Equal versions: origin id breaks the tie, never both supersede.
        let rival = KeyRecord {
            origin: NodeId::from_addr("beta.onion:9000"),
            ..older.clone()
        };
        assert!(rival.supersedes(&older) != older.supersedes(&rival));
    }

    #[test]
    fn message_id_is_content_derived_and_stable() {
        let origin = NodeId::from_addr("alpha.onion:9000");
        let m1 = Message::new("alice", "hello", origin);
        let m2 = m1.clone();
        assert_eq!(m1.message_id(), m2.message_id());

        let mut m3 = m1.clone();
        m3.body = "hello!".to_string();
        assert_ne!(m1.message_id(), m3.message_id());
    }
}
