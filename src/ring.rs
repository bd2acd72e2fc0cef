//! # Ring Membership
//!
//! Maintains this node's view of the identifier ring: its successor, its
//! predecessor, and a 256-entry finger table where entry *i* points at the
//! node responsible for `self + 2^i`. The view lives in an actor behind the
//! cloneable [`Ring`] handle.
//!
//! ## Stabilization
//!
//! A freshly joined node knows only its successor. [`spawn_stabilizer`] runs
//! one round per interval:
//!
//! 1. Ask the successor for its predecessor; adopt it as the new successor
//!    when it sits between us and the current successor.
//! 2. Notify the successor that we believe we precede it.
//! 3. Ping our predecessor; clear it when the ping fails.
//! 4. Refresh one finger table entry per round, cycling through all 256.
//!
//! Under continued rounds on every node, an arbitrary set of joined nodes
//! converges to a single consistent cycle.
//!
//! ## Failure Handling
//!
//! When a request to the successor fails, the ring falls back to the nearest
//! live finger past the failed node, or reverts to a singleton ring when no
//! candidate remains. Keys resident on the failed node are lost; the overlay
//! does not replicate.

use crate::identity::{in_open_closed_interval, in_open_interval, NodeId, PeerInfo, RING_BITS};
use crate::protocols::{FindOutcome, RingRpc};
use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Bound on redirect hops while joining through a bootstrap node.
const MAX_JOIN_HOPS: usize = 64;

/// Notifications emitted when the local ring view changes.
#[derive(Clone, Debug)]
pub enum RingEvent {
    /// A new predecessor was adopted. The storage layer migrates keys the
    /// new predecessor now owns.
    PredecessorChanged { new: PeerInfo },
}

/// A point-in-time copy of the local ring view.
#[derive(Clone, Debug)]
pub struct RingSnapshot {
    pub self_info: PeerInfo,
    pub successor: PeerInfo,
    pub predecessor: Option<PeerInfo>,
    /// Populated finger entries as `(index, peer)` pairs.
    pub fingers: Vec<(usize, PeerInfo)>,
}

impl RingSnapshot {
    /// True when this node is alone on the ring.
    pub fn is_singleton(&self) -> bool {
        self.successor.id == self.self_info.id
    }

    /// The known peer most closely preceding `target` clockwise, excluding
    /// this node itself. `None` when no known peer precedes the target.
    pub fn closest_preceding(&self, target: &NodeId) -> Option<PeerInfo> {
        self.preceding_candidates(target).into_iter().next()
    }

    /// All known peers strictly between this node and `target`, ordered
    /// nearest-to-target first. Used as a fallback stack during lookups.
    pub fn preceding_candidates(&self, target: &NodeId) -> Vec<PeerInfo> {
        let mut seen = HashSet::new();
        let mut candidates: Vec<PeerInfo> = self
            .fingers
            .iter()
            .map(|(_, p)| p)
            .chain(std::iter::once(&self.successor))
            .filter(|p| p.id != self.self_info.id)
            .filter(|p| in_open_interval(&p.id, &self.self_info.id, target))
            .filter(|p| seen.insert(p.id))
            .cloned()
            .collect();
        candidates.sort_by_key(|p| p.id.distance_clockwise(target));
        candidates
    }
}

enum Command {
    Snapshot(oneshot::Sender<RingSnapshot>),
    FindSuccessor(NodeId, oneshot::Sender<FindOutcome>),
    Notify(PeerInfo),
    InstallSuccessor(PeerInfo),
    ClearPredecessor,
    SuccessorFailed(NodeId),
    NextFingerTarget(oneshot::Sender<(usize, NodeId)>),
    InstallFinger(usize, PeerInfo),
    Quit(oneshot::Sender<()>),
}

/// Handle to the ring actor. Clone freely.
pub struct Ring<N> {
    tx: mpsc::Sender<Command>,
    self_info: PeerInfo,
    network: Arc<N>,
}

impl<N> Clone for Ring<N> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            self_info: self.self_info.clone(),
            network: self.network.clone(),
        }
    }
}

impl<N: RingRpc> Ring<N> {
    /// Spawn the ring actor with a singleton view (successor = self).
    /// Returns the handle and the event stream for the storage layer.
    pub fn spawn(self_info: PeerInfo, network: Arc<N>) -> (Self, mpsc::Receiver<RingEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(64);
        let actor = RingActor {
            rx,
            events: event_tx,
            self_info: self_info.clone(),
            successor: self_info.clone(),
            predecessor: None,
            fingers: vec![None; RING_BITS],
            finger_cursor: 0,
        };
        tokio::spawn(actor.run());
        let ring = Self {
            tx,
            self_info,
            network,
        };
        (ring, event_rx)
    }

    pub fn id(&self) -> NodeId {
        self.self_info.id
    }

    pub fn self_info(&self) -> &PeerInfo {
        &self.self_info
    }

    /// The RPC client shared with the router and stabilizer.
    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub async fn snapshot(&self) -> Result<RingSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| anyhow!("ring is shut down"))?;
        rx.await.map_err(|_| anyhow!("ring is shut down"))
    }

    pub async fn successor(&self) -> Result<PeerInfo> {
        Ok(self.snapshot().await?.successor)
    }

    pub async fn predecessor(&self) -> Result<Option<PeerInfo>> {
        Ok(self.snapshot().await?.predecessor)
    }

    /// Answer a successor query from the local view.
    pub async fn handle_find_successor(&self, id: NodeId) -> Result<FindOutcome> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::FindSuccessor(id, tx))
            .await
            .map_err(|_| anyhow!("ring is shut down"))?;
        rx.await.map_err(|_| anyhow!("ring is shut down"))
    }

    /// Process a notify from a node claiming to precede us.
    pub async fn handle_notify(&self, from: PeerInfo) -> Result<()> {
        self.tx
            .send(Command::Notify(from))
            .await
            .map_err(|_| anyhow!("ring is shut down"))
    }

    pub async fn install_successor(&self, peer: PeerInfo) {
        let _ = self.tx.send(Command::InstallSuccessor(peer)).await;
    }

    pub async fn clear_predecessor(&self) {
        let _ = self.tx.send(Command::ClearPredecessor).await;
    }

    /// Report that a request to the successor failed. The actor ignores the
    /// report when the successor has already changed.
    pub async fn successor_failed(&self, failed: NodeId) {
        let _ = self.tx.send(Command::SuccessorFailed(failed)).await;
    }

    async fn next_finger_target(&self) -> Result<(usize, NodeId)> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::NextFingerTarget(tx))
            .await
            .map_err(|_| anyhow!("ring is shut down"))?;
        rx.await.map_err(|_| anyhow!("ring is shut down"))
    }

    pub async fn install_finger(&self, index: usize, peer: PeerInfo) {
        let _ = self.tx.send(Command::InstallFinger(index, peer)).await;
    }

    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Join an existing ring through a bootstrap peer: resolve our own id to
    /// its successor, install it, and notify it. Follows redirects up to
    /// [`MAX_JOIN_HOPS`].
    pub async fn join(&self, bootstrap: PeerInfo) -> Result<()> {
        let mut current = bootstrap;
        let mut visited = HashSet::new();
        for _ in 0..MAX_JOIN_HOPS {
            if !visited.insert(current.id) {
                return Err(anyhow!("join loop detected at {}", current.addr));
            }
            match self.network.find_successor(&current, self.id()).await? {
                FindOutcome::Found(peer) => {
                    // A node that knows us already answers with our own id;
                    // the node we asked is then our actual successor.
                    let successor = if peer.id == self.id() { current } else { peer };
                    info!(successor = %successor.id, "joined ring");
                    self.install_successor(successor.clone()).await;
                    if let Err(e) = self.network.notify(&successor).await {
                        debug!(error = %e, "initial notify failed, stabilizer will retry");
                    }
                    return Ok(());
                }
                FindOutcome::Redirect(next) => {
                    trace!(via = %next.id, "join redirect");
                    current = next;
                }
            }
        }
        Err(anyhow!("join exceeded {MAX_JOIN_HOPS} hops"))
    }
}

struct RingActor {
    rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<RingEvent>,
    self_info: PeerInfo,
    successor: PeerInfo,
    predecessor: Option<PeerInfo>,
    fingers: Vec<Option<PeerInfo>>,
    finger_cursor: usize,
}

impl RingActor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::FindSuccessor(id, reply) => {
                    let _ = reply.send(self.find_successor(id));
                }
                Command::Notify(from) => self.notify(from).await,
                Command::InstallSuccessor(peer) => self.install_successor(peer),
                Command::ClearPredecessor => {
                    if let Some(old) = self.predecessor.take() {
                        debug!(was = %old.id, "cleared unreachable predecessor");
                    }
                }
                Command::SuccessorFailed(failed) => self.successor_failed(failed),
                Command::NextFingerTarget(reply) => {
                    let index = self.finger_cursor;
                    self.finger_cursor = (self.finger_cursor + 1) % RING_BITS;
                    let target = self.self_info.id.add_power_of_two(index);
                    let _ = reply.send((index, target));
                }
                Command::InstallFinger(index, peer) => {
                    if index < RING_BITS && peer.id != self.self_info.id {
                        self.fingers[index] = Some(peer);
                    } else if index < RING_BITS {
                        self.fingers[index] = None;
                    }
                }
                Command::Quit(done) => {
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("ring actor stopped");
    }

    fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            self_info: self.self_info.clone(),
            successor: self.successor.clone(),
            predecessor: self.predecessor.clone(),
            fingers: self
                .fingers
                .iter()
                .enumerate()
                .filter_map(|(i, f)| f.clone().map(|p| (i, p)))
                .collect(),
        }
    }

    fn find_successor(&self, id: NodeId) -> FindOutcome {
        let me = self.self_info.id;
        // Singleton ring: this node owns everything.
        if self.successor.id == me {
            return FindOutcome::Found(self.self_info.clone());
        }
        // Keys in (predecessor, self] are ours.
        if let Some(pred) = &self.predecessor {
            if in_open_closed_interval(&id, &pred.id, &me) {
                return FindOutcome::Found(self.self_info.clone());
            }
        }
        // Keys in (self, successor] belong to the successor.
        if in_open_closed_interval(&id, &me, &self.successor.id) {
            return FindOutcome::Found(self.successor.clone());
        }
        match self.snapshot().closest_preceding(&id) {
            Some(peer) => FindOutcome::Redirect(peer),
            None => FindOutcome::Redirect(self.successor.clone()),
        }
    }

    async fn notify(&mut self, from: PeerInfo) {
        if from.id == self.self_info.id || !from.is_consistent() {
            return;
        }
        let adopt = match &self.predecessor {
            None => true,
            Some(pred) => in_open_interval(&from.id, &pred.id, &self.self_info.id),
        };
        if adopt {
            info!(predecessor = %from.id, "adopted new predecessor");
            self.predecessor = Some(from.clone());
            let _ = self
                .events
                .send(RingEvent::PredecessorChanged { new: from.clone() })
                .await;
        } else {
            trace!(from = %from.id, "notify did not displace current predecessor");
        }
        // A singleton learning of any peer gains a successor too.
        if self.successor.id == self.self_info.id {
            self.install_successor(from);
        }
    }

    fn install_successor(&mut self, peer: PeerInfo) {
        if peer.id != self.successor.id {
            debug!(successor = %peer.id, "successor updated");
        }
        self.successor = peer;
    }

    fn successor_failed(&mut self, failed: NodeId) {
        if self.successor.id != failed {
            // Stale report from before the last successor change.
            return;
        }
        for slot in self.fingers.iter_mut() {
            if slot.as_ref().is_some_and(|p| p.id == failed) {
                *slot = None;
            }
        }
        if self.predecessor.as_ref().is_some_and(|p| p.id == failed) {
            self.predecessor = None;
        }
        // Nearest finger past the failed node becomes the new successor.
        let replacement = self
            .fingers
            .iter()
            .flatten()
            .filter(|p| p.id != failed && p.id != self.self_info.id)
            .min_by_key(|p| self.self_info.id.distance_clockwise(&p.id))
            .cloned();
        match replacement {
            Some(peer) => {
                warn!(failed = %failed, replacement = %peer.id, "successor failed, promoting finger");
                self.successor = peer;
            }
            None => {
                warn!(failed = %failed, "successor failed with no replacement, reverting to singleton");
                self.successor = self.self_info.clone();
            }
        }
    }
}

/// Run periodic stabilization rounds until the ring shuts down.
pub fn spawn_stabilizer<N: RingRpc>(
    ring: Ring<N>,
    router: crate::router::Router<N>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if stabilize_round(&ring, &router).await.is_err() {
                // Ring actor is gone; nothing left to maintain.
                break;
            }
        }
    })
}

async fn stabilize_round<N: RingRpc>(
    ring: &Ring<N>,
    router: &crate::router::Router<N>,
) -> Result<()> {
    let snap = ring.snapshot().await?;
    let network = ring.network();

    if !snap.is_singleton() {
        match network.get_predecessor(&snap.successor).await {
            Ok(Some(x)) if in_open_interval(&x.id, &snap.self_info.id, &snap.successor.id) => {
                ring.install_successor(x).await;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(successor = %snap.successor.id, error = %e, "successor unreachable");
                ring.successor_failed(snap.successor.id).await;
            }
        }
        let snap = ring.snapshot().await?;
        if !snap.is_singleton() {
            if let Err(e) = network.notify(&snap.successor).await {
                trace!(error = %e, "notify failed");
            }
        }
    }

    if let Some(pred) = &snap.predecessor {
        if network.ping(pred).await.is_err() {
            ring.clear_predecessor().await;
        }
    }

    // One finger per round keeps maintenance traffic flat.
    let (index, target) = ring.next_finger_target().await?;
    if !ring.snapshot().await?.is_singleton() {
        if let Ok(owner) = router.locate_id(target).await {
            ring.install_finger(index, owner).await;
        }
    }
    Ok(())
}
