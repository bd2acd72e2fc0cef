//! # Iterative Lookup
//!
//! Resolves an identifier to the peer responsible for it. The querying node
//! drives the whole lookup itself: it asks the best-known candidate, follows
//! `Redirect` answers, and falls back to the next-best local candidate when a
//! hop fails. Remote nodes never forward on our behalf, so a slow or dead
//! node costs one timeout rather than a stuck query.
//!
//! Lookups are bounded by a hop budget. Exhausting it surfaces as
//! [`LookupError::HopBudgetExhausted`], which callers treat as a transient
//! ring inconsistency rather than proof of absence.

use crate::identity::{in_open_closed_interval, NodeId, PeerInfo};
use crate::protocols::{FindOutcome, RingRpc};
use crate::ring::Ring;
use anyhow::Result;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Default hop budget for one lookup.
pub const MAX_LOOKUP_HOPS: usize = 32;

/// Why a lookup could not produce an owner.
#[derive(Debug)]
pub enum LookupError {
    /// The redirect chain outran the hop budget, usually because the ring is
    /// still converging after churn.
    HopBudgetExhausted { hops: usize },
    /// Every candidate path failed.
    NoRoute,
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::HopBudgetExhausted { hops } => {
                write!(f, "lookup exhausted its hop budget after {hops} hops")
            }
            LookupError::NoRoute => write!(f, "no reachable route to the responsible node"),
        }
    }
}

impl std::error::Error for LookupError {}

/// Resolves keys to their responsible peers using the local ring view.
pub struct Router<N> {
    ring: Ring<N>,
    max_hops: usize,
}

impl<N> Clone for Router<N> {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring.clone(),
            max_hops: self.max_hops,
        }
    }
}

impl<N: RingRpc> Router<N> {
    pub fn new(ring: Ring<N>, max_hops: usize) -> Self {
        Self { ring, max_hops }
    }

    /// Resolve an application key to the peer that owns it.
    pub async fn locate(&self, key: &[u8]) -> Result<PeerInfo> {
        self.locate_id(NodeId::from_key(key)).await
    }

    /// Resolve a ring identifier to the peer that owns it.
    pub async fn locate_id(&self, id: NodeId) -> Result<PeerInfo> {
        Ok(self.locate_id_traced(id).await?.0)
    }

    /// [`Router::locate`] plus the number of remote hops the lookup took.
    pub async fn locate_traced(&self, key: &[u8]) -> Result<(PeerInfo, usize)> {
        self.locate_id_traced(NodeId::from_key(key)).await
    }

    /// Resolve a ring identifier, reporting how many remote queries were
    /// issued. Locally-answered lookups report zero hops.
    pub async fn locate_id_traced(&self, id: NodeId) -> Result<(PeerInfo, usize)> {
        let snap = self.ring.snapshot().await?;
        let me = snap.self_info.id;

        // Answers available without touching the network.
        if snap.is_singleton() {
            return Ok((snap.self_info, 0));
        }
        if let Some(pred) = &snap.predecessor {
            if in_open_closed_interval(&id, &pred.id, &me) {
                return Ok((snap.self_info, 0));
            }
        }
        if in_open_closed_interval(&id, &me, &snap.successor.id) {
            return Ok((snap.successor, 0));
        }

        // Nearest-to-target candidates first; the successor is always among
        // them or is the implicit last resort.
        let mut candidates = snap.preceding_candidates(&id);
        if candidates.is_empty() {
            candidates.push(snap.successor.clone());
        }
        let mut candidates = candidates.into_iter();

        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut hops = 0usize;
        let mut current = match candidates.next() {
            Some(peer) => peer,
            None => return Err(LookupError::NoRoute.into()),
        };

        loop {
            if hops >= self.max_hops {
                debug!(target = %id, hops, "lookup hop budget exhausted");
                return Err(LookupError::HopBudgetExhausted { hops }.into());
            }
            hops += 1;
            visited.insert(current.id);

            match self.ring.network().find_successor(&current, id).await {
                Ok(FindOutcome::Found(owner)) => {
                    trace!(target = %id, owner = %owner.id, hops, "lookup resolved");
                    return Ok((owner, hops));
                }
                Ok(FindOutcome::Redirect(next)) => {
                    if next.id == current.id || visited.contains(&next.id) {
                        // The redirect loops back; the queried node's view
                        // says it is the closest predecessor it knows.
                        return Ok((current, hops));
                    }
                    current = next;
                }
                Err(e) => {
                    trace!(target = %id, via = %current.id, error = %e, "lookup hop failed");
                    // Fall back to the next-best candidate from the
                    // original local view.
                    match candidates.find(|p| !visited.contains(&p.id)) {
                        Some(peer) => current = peer,
                        None => return Err(LookupError::NoRoute.into()),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Scripted network: maps (queried peer, no target discrimination)
    /// to canned outcomes, with dead peers erroring out.
    struct ScriptedNet {
        answers: HashMap<NodeId, FindOutcome>,
        dead: HashSet<NodeId>,
    }

    #[async_trait]
    impl RingRpc for ScriptedNet {
        async fn find_successor(&self, to: &PeerInfo, _id: NodeId) -> Result<FindOutcome> {
            if self.dead.contains(&to.id) {
                return Err(anyhow!("unreachable"));
            }
            self.answers
                .get(&to.id)
                .cloned()
                .ok_or_else(|| anyhow!("no script for {}", to.id))
        }
        async fn get_predecessor(&self, _to: &PeerInfo) -> Result<Option<PeerInfo>> {
            Ok(None)
        }
        async fn notify(&self, _to: &PeerInfo) -> Result<()> {
            Ok(())
        }
        async fn ping(&self, _to: &PeerInfo) -> Result<()> {
            Ok(())
        }
    }

    fn peer(name: &str) -> PeerInfo {
        PeerInfo::from_addr(format!("{name}.onion:9000"))
    }

    async fn router_with(
        self_addr: &str,
        successor: PeerInfo,
        net: ScriptedNet,
        max_hops: usize,
    ) -> Router<ScriptedNet> {
        let (ring, _events) = Ring::spawn(PeerInfo::from_addr(self_addr), Arc::new(net));
        ring.install_successor(successor).await;
        Router::new(ring, max_hops)
    }

    #[tokio::test]
    async fn singleton_resolves_to_self() {
        let net = ScriptedNet {
            answers: HashMap::new(),
            dead: HashSet::new(),
        };
        let (ring, _events) = Ring::spawn(peer("solo").clone(), Arc::new(net));
        let router = Router::new(ring.clone(), MAX_LOOKUP_HOPS);
        let owner = router.locate(b"key").await.unwrap();
        assert_eq!(owner.id, ring.id());
    }

    #[tokio::test]
    async fn follows_redirect_chain_to_owner() {
        let a = peer("a");
        let b = peer("b");
        let owner = peer("owner");
        let mut answers = HashMap::new();
        answers.insert(a.id, FindOutcome::Redirect(b.clone()));
        answers.insert(b.id, FindOutcome::Found(owner.clone()));
        let net = ScriptedNet {
            answers,
            dead: HashSet::new(),
        };
        let router = router_with("me", a.clone(), net, MAX_LOOKUP_HOPS).await;

        // Pick an id outside (me, a] so the router must go remote.
        let me = NodeId::from_addr("me.onion:9000");
        let id = a.id.add_power_of_two(0);
        assert!(!in_open_closed_interval(&id, &me, &a.id));
        let (resolved, hops) = router.locate_id_traced(id).await.unwrap();
        assert_eq!(resolved.id, owner.id);
        // One redirect through `a` plus the terminal answer from `b`.
        assert_eq!(hops, 2);
    }

    #[tokio::test]
    async fn local_answers_take_zero_hops() {
        let a = peer("a");
        let net = ScriptedNet {
            answers: HashMap::new(),
            dead: HashSet::new(),
        };
        let router = router_with("me", a.clone(), net, MAX_LOOKUP_HOPS).await;

        // Anything in (me, a] is the successor's without going remote.
        let me = NodeId::from_addr("me.onion:9000");
        let id = a.id;
        assert!(in_open_closed_interval(&id, &me, &a.id));
        let (resolved, hops) = router.locate_id_traced(id).await.unwrap();
        assert_eq!(resolved.id, a.id);
        assert_eq!(hops, 0);
    }

    #[tokio::test]
    async fn hop_budget_is_enforced() {
        let a = peer("a");
        let b = peer("b");
        let c = peer("c");
        // a -> b -> c -> a: an endless redirect cycle would spin forever
        // without either the visited check or the budget; force the budget
        // path by making each hop redirect to a fresh pair alternately.
        let mut answers = HashMap::new();
        answers.insert(a.id, FindOutcome::Redirect(b.clone()));
        answers.insert(b.id, FindOutcome::Redirect(c.clone()));
        answers.insert(c.id, FindOutcome::Redirect(a.clone()));
        let net = ScriptedNet {
            answers,
            dead: HashSet::new(),
        };
        let router = router_with("me", a.clone(), net, 2).await;

        let id = a.id.add_power_of_two(0);
        let err = router.locate_id(id).await.unwrap_err();
        // Either the budget trips or the visited check short-circuits to a
        // peer; with max_hops=2 the budget trips first on a 3-cycle.
        assert!(err.downcast_ref::<LookupError>().is_some() || err.to_string().contains("hop"));
    }

    #[tokio::test]
    async fn dead_first_candidate_falls_back() {
        let me_addr = "me.onion:9000";
        let me = NodeId::from_addr(me_addr);
        // Successor is the only candidate besides fingers; make the finger
        // dead so the lookup falls back to the successor.
        let owner = peer("owner");
        let mut peers: Vec<PeerInfo> = (0..16).map(|i| peer(&format!("n{i}"))).collect();
        peers.sort_by_key(|p| me.distance_clockwise(&p.id));
        let successor = peers[0].clone();
        let finger = peers[8].clone();

        let mut answers = HashMap::new();
        answers.insert(successor.id, FindOutcome::Found(owner.clone()));
        let mut dead = HashSet::new();
        dead.insert(finger.id);
        let net = ScriptedNet { answers, dead };

        let (ring, _events) = Ring::spawn(PeerInfo::from_addr(me_addr), Arc::new(net));
        ring.install_successor(successor.clone()).await;
        ring.install_finger(128, finger.clone()).await;
        let router = Router::new(ring, MAX_LOOKUP_HOPS);

        // Target past the finger so the finger ranks before the successor.
        let id = finger.id.add_power_of_two(1);
        if in_open_closed_interval(&id, &me, &successor.id) {
            // Degenerate placement: local answer, nothing to assert remotely.
            return;
        }
        let resolved = router.locate_id(id).await.unwrap();
        assert_eq!(resolved.id, owner.id);
    }

    #[tokio::test]
    async fn all_candidates_dead_is_no_route() {
        let me_addr = "me.onion:9000";
        let me = NodeId::from_addr(me_addr);
        let mut peers: Vec<PeerInfo> = (0..8).map(|i| peer(&format!("d{i}"))).collect();
        peers.sort_by_key(|p| me.distance_clockwise(&p.id));
        let successor = peers[0].clone();

        let dead: HashSet<NodeId> = peers.iter().map(|p| p.id).collect();
        let net = ScriptedNet {
            answers: HashMap::new(),
            dead,
        };
        let (ring, _events) = Ring::spawn(PeerInfo::from_addr(me_addr), Arc::new(net));
        ring.install_successor(successor.clone()).await;
        let router = Router::new(ring, MAX_LOOKUP_HOPS);

        let id = successor.id.add_power_of_two(0);
        if in_open_closed_interval(&id, &me, &successor.id) {
            return;
        }
        let err = router.locate_id(id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LookupError>(),
            Some(LookupError::NoRoute)
        ));
    }
}
