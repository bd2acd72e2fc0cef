//! # Peer Registry
//!
//! Tracks every peer this node has heard of, with a connection state machine
//! per peer and activity timestamps for pruning. The registry is an actor
//! behind a cheap-to-clone [`Registry`] handle; the RPC layer reports state
//! transitions and the ring reads snapshots.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──mark_connecting──▶ Connecting ──mark_connected──▶ Connected
//!      ▲                                │                              │
//!      └────────────────────────────────┴──────mark_disconnected──────┘
//! ```
//!
//! ## Limits
//!
//! - At most `max_established` peers may be Connected; admitting another
//!   evicts the least-recently-active Connected peer.
//! - Peers silent for longer than `prune_after` are dropped entirely on the
//!   periodic prune tick, except the current successor and predecessor are
//!   never the registry's concern to protect; the ring holds its own copies.

use crate::identity::{now_ms, NodeId, PeerInfo};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// How often the prune tick runs relative to the prune deadline.
const PRUNE_DIVISOR: u32 = 4;

/// Connection state of a tracked peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of one registry entry.
#[derive(Clone, Debug)]
pub struct Peer {
    pub info: PeerInfo,
    pub state: PeerState,
    /// Milliseconds since epoch of the last observed activity.
    pub last_active: u64,
}

/// Out-of-band notifications from the registry actor.
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    /// A Connected peer was displaced to stay within `max_established`.
    /// Whoever pools connections to it should drop them.
    Evicted(PeerInfo),
}

enum Command {
    Observe(PeerInfo),
    MarkConnecting(NodeId, oneshot::Sender<Result<()>>),
    MarkConnected(NodeId),
    MarkDisconnected(NodeId),
    Touch(NodeId),
    Get(NodeId, oneshot::Sender<Option<Peer>>),
    Snapshot(oneshot::Sender<Vec<Peer>>),
    ConnectedPeers(oneshot::Sender<Vec<PeerInfo>>),
    Quit(oneshot::Sender<()>),
}

/// Handle to the registry actor. Clone freely.
#[derive(Clone)]
pub struct Registry {
    tx: mpsc::Sender<Command>,
}

impl Registry {
    /// Spawn the registry actor. The returned receiver carries
    /// [`RegistryEvent`]s; dropping it silently discards them.
    pub fn spawn(
        max_established: usize,
        max_pending: usize,
        prune_after: Duration,
    ) -> (Self, mpsc::Receiver<RegistryEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(32);
        let actor = RegistryActor {
            rx,
            events: events_tx,
            peers: HashMap::new(),
            max_established,
            max_pending,
            prune_after,
        };
        tokio::spawn(actor.run());
        (Self { tx }, events_rx)
    }

    /// Record that a peer exists. Inconsistent records (id not derived from
    /// the address) are dropped with a warning.
    pub async fn observe(&self, info: PeerInfo) {
        let _ = self.tx.send(Command::Observe(info)).await;
    }

    /// Reserve a pending connection slot. Fails when `max_pending` attempts
    /// are already in flight.
    pub async fn mark_connecting(&self, id: NodeId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::MarkConnecting(id, tx))
            .await
            .map_err(|_| anyhow!("registry is shut down"))?;
        rx.await.map_err(|_| anyhow!("registry is shut down"))?
    }

    pub async fn mark_connected(&self, id: NodeId) {
        let _ = self.tx.send(Command::MarkConnected(id)).await;
    }

    pub async fn mark_disconnected(&self, id: NodeId) {
        let _ = self.tx.send(Command::MarkDisconnected(id)).await;
    }

    /// Refresh a peer's activity timestamp.
    pub async fn touch(&self, id: NodeId) {
        let _ = self.tx.send(Command::Touch(id)).await;
    }

    pub async fn get(&self, id: NodeId) -> Option<Peer> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Get(id, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    /// All tracked peers, in no particular order.
    pub async fn snapshot(&self) -> Vec<Peer> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Peers currently in the Connected state; the broadcast fanout set.
    pub async fn connected_peers(&self) -> Vec<PeerInfo> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::ConnectedPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the actor and wait for it to drain.
    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct RegistryActor {
    rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<RegistryEvent>,
    peers: HashMap<NodeId, Peer>,
    max_established: usize,
    max_pending: usize,
    prune_after: Duration,
}

impl RegistryActor {
    async fn run(mut self) {
        let tick = self.prune_after.max(Duration::from_millis(100)) / PRUNE_DIVISOR;
        let mut prune = tokio::time::interval(tick);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(Command::Quit(done)) => {
                            let _ = done.send(());
                            break;
                        }
                        Some(other) => self.handle(other),
                        None => break,
                    }
                }
                _ = prune.tick() => self.prune(),
            }
        }
        debug!("registry actor stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Observe(info) => self.observe(info),
            Command::MarkConnecting(id, reply) => {
                let _ = reply.send(self.mark_connecting(id));
            }
            Command::MarkConnected(id) => self.mark_connected(id),
            Command::MarkDisconnected(id) => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.state = PeerState::Disconnected;
                }
            }
            Command::Touch(id) => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.last_active = now_ms();
                }
            }
            Command::Get(id, reply) => {
                let _ = reply.send(self.peers.get(&id).cloned());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.peers.values().cloned().collect());
            }
            Command::ConnectedPeers(reply) => {
                let peers = self
                    .peers
                    .values()
                    .filter(|p| p.state == PeerState::Connected)
                    .map(|p| p.info.clone())
                    .collect();
                let _ = reply.send(peers);
            }
            Command::Quit(_) => unreachable!("handled in run loop"),
        }
    }

    fn observe(&mut self, info: PeerInfo) {
        if !info.is_consistent() {
            warn!(addr = %info.addr, claimed = %info.id, "rejecting peer with mismatched identity");
            return;
        }
        let now = now_ms();
        self.peers
            .entry(info.id)
            .and_modify(|p| {
                p.last_active = now;
                if info.timestamp > p.info.timestamp {
                    p.info = info.clone();
                }
            })
            .or_insert_with(|| {
                trace!(peer = %info.id, addr = %info.addr, "observed new peer");
                Peer {
                    info,
                    state: PeerState::Disconnected,
                    last_active: now,
                }
            });
    }

    fn mark_connecting(&mut self, id: NodeId) -> Result<()> {
        let pending = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Connecting)
            .count();
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or_else(|| anyhow!("peer {id} not observed"))?;
        if peer.state == PeerState::Connecting {
            return Ok(());
        }
        if pending >= self.max_pending {
            return Err(anyhow!(
                "too many pending connection attempts ({pending}/{})",
                self.max_pending
            ));
        }
        peer.state = PeerState::Connecting;
        peer.last_active = now_ms();
        Ok(())
    }

    fn mark_connected(&mut self, id: NodeId) {
        let connected = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Connected && p.info.id != id)
            .count();
        if connected >= self.max_established {
            // Evict the least-recently-active established peer to stay
            // within the connection cap.
            if let Some(victim) = self
                .peers
                .values()
                .filter(|p| p.state == PeerState::Connected && p.info.id != id)
                .min_by_key(|p| p.last_active)
                .map(|p| p.info.clone())
            {
                debug!(peer = %victim.id, "evicting least-recently-active peer");
                if let Some(peer) = self.peers.get_mut(&victim.id) {
                    peer.state = PeerState::Disconnected;
                }
                let _ = self.events.try_send(RegistryEvent::Evicted(victim));
            }
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.state = PeerState::Connected;
            peer.last_active = now_ms();
        }
    }

    fn prune(&mut self) {
        let cutoff = now_ms().saturating_sub(self.prune_after.as_millis() as u64);
        let before = self.peers.len();
        self.peers
            .retain(|_, p| p.state != PeerState::Disconnected || p.last_active >= cutoff);
        let dropped = before - self.peers.len();
        if dropped > 0 {
            debug!(dropped, remaining = self.peers.len(), "pruned stale peers");
        }
    }
}
