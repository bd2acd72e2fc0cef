//! Shared helpers for overlay integration tests: fast-stabilizing configs,
//! multi-node rings over the in-memory transport, and convergence polling.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use veilring::{MemoryNet, Node, NodeId, OverlayConfig, PeerState};

/// Config tuned for tests: stabilization every 50ms so rings converge in
/// well under a second per membership change.
pub fn fast_config() -> OverlayConfig {
    OverlayConfig {
        stabilize_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(2),
        prune_after: Duration::from_secs(60),
        ..OverlayConfig::default()
    }
}

/// Spawn `n` nodes on one in-memory network; nodes after the first join
/// through the first.
pub async fn spawn_ring(net: &MemoryNet, n: usize) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::with_capacity(n);
    for i in 0..n {
        let node = Node::bind(Arc::new(net.transport()), fast_config())
            .await
            .expect("node bind failed");
        if i > 0 {
            node.join(nodes[0].onion_host())
                .await
                .expect("join through bootstrap failed");
        }
        nodes.push(node);
    }
    nodes
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// True when the successor pointers of `nodes` form one cycle covering
/// every node.
pub async fn ring_is_closed(nodes: &[Node]) -> bool {
    let by_id: HashMap<NodeId, &Node> = nodes.iter().map(|n| (n.node_id(), n)).collect();
    let mut current = nodes[0].node_id();
    for _ in 0..nodes.len() {
        let Some(node) = by_id.get(&current) else {
            return false;
        };
        let Ok(successor) = node.successor().await else {
            return false;
        };
        current = successor.id;
    }
    // After exactly n successor hops we must be back at the start, having
    // passed through every node (a shorter cycle revisits earlier).
    if current != nodes[0].node_id() {
        return false;
    }
    let mut seen = std::collections::HashSet::new();
    let mut walk = nodes[0].node_id();
    for _ in 0..nodes.len() {
        if !seen.insert(walk) {
            return false;
        }
        let Some(node) = by_id.get(&walk) else {
            return false;
        };
        let Ok(successor) = node.successor().await else {
            return false;
        };
        walk = successor.id;
    }
    seen.len() == nodes.len()
}

/// Wait until the ring closes, panicking with a diagnostic on timeout.
pub async fn await_convergence(nodes: &[Node]) {
    let converged = wait_for(Duration::from_secs(20), move || ring_is_closed(nodes)).await;
    if !converged {
        let mut views = Vec::new();
        for node in nodes {
            let succ = node.successor().await.ok().map(|p| p.id.to_hex());
            views.push(format!("{} -> {:?}", node.node_id(), succ));
        }
        panic!("ring failed to converge:\n{}", views.join("\n"));
    }
}

/// The node that should own `key` given the full membership: the first node
/// clockwise at or after the key's hash.
pub fn expected_owner(nodes: &[Node], key: &[u8]) -> NodeId {
    let hash = NodeId::from_key(key);
    let mut ids: Vec<NodeId> = nodes.iter().map(|n| n.node_id()).collect();
    ids.sort();
    *ids.iter().find(|id| **id >= hash).unwrap_or(&ids[0])
}

/// Wait until `node` has at least `count` peers in the Connected state.
pub async fn await_connected_peers(node: &Node, count: usize) -> bool {
    wait_for(Duration::from_secs(10), move || async move {
        node.peers()
            .await
            .iter()
            .filter(|p| p.state == PeerState::Connected)
            .count()
            >= count
    })
    .await
}
