//! Protocol trait definitions for veilring's networking layer.
//!
//! This module defines the core protocol traits that abstract over the
//! underlying RPC transport. Each protocol (ring maintenance, storage,
//! broadcast) has its own trait that defines the operations it supports.
//!
//! ## Protocol Traits
//!
//! | Protocol | Trait | Purpose |
//! |----------|-------|---------|
//! | Ring | [`RingRpc`] | Successor lookup and stabilization |
//! | Store | [`StoreRpc`] | Key/value storage and migration |
//! | Broadcast | [`BroadcastRpc`] | Flood forwarding of application messages |
//!
//! ## Design
//!
//! Traits are defined here separately from implementations to:
//! - Let the ring and router depend only on traits, not on the RPC node
//! - Let tests substitute scripted network behavior
//! - Avoid circular dependencies between modules

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{NodeId, PeerInfo};
use crate::messages::{KeyRecord, Message};

/// Outcome of a remote successor query.
#[derive(Clone, Debug)]
pub enum FindOutcome {
    /// The queried node knows the responsible node.
    Found(PeerInfo),
    /// Ask this closer node instead.
    Redirect(PeerInfo),
}

/// Ring maintenance operations performed against remote nodes.
#[async_trait]
pub trait RingRpc: Send + Sync + 'static {
    /// Ask `to` which node is responsible for `id`.
    async fn find_successor(&self, to: &PeerInfo, id: NodeId) -> Result<FindOutcome>;

    /// Ask `to` for its current predecessor, if it has one.
    async fn get_predecessor(&self, to: &PeerInfo) -> Result<Option<PeerInfo>>;

    /// Tell `to` that we believe we are its predecessor.
    async fn notify(&self, to: &PeerInfo) -> Result<()>;

    /// Liveness probe.
    async fn ping(&self, to: &PeerInfo) -> Result<()>;
}

/// Storage operations performed against remote nodes.
#[async_trait]
pub trait StoreRpc: Send + Sync + 'static {
    /// Store a record on `to`.
    async fn put(&self, to: &PeerInfo, record: KeyRecord) -> Result<()>;

    /// Fetch a record from `to`.
    async fn get(&self, to: &PeerInfo, key: NodeId) -> Result<Option<KeyRecord>>;

    /// Remove a record from `to`, returning the previous value if any.
    async fn delete(&self, to: &PeerInfo, key: NodeId) -> Result<Option<Vec<u8>>>;

    /// Hand over a batch of records `to` now owns.
    async fn transfer(&self, to: &PeerInfo, records: Vec<KeyRecord>) -> Result<()>;
}

/// Flood-forwarding of application broadcast messages.
#[async_trait]
pub trait BroadcastRpc: Send + Sync + 'static {
    /// Deliver a broadcast message to `to`.
    async fn broadcast(&self, to: &PeerInfo, message: Message) -> Result<()>;
}
