//! Ring membership tests: joins converge to a single cycle, lookups agree
//! across nodes, and the ring heals around failed members.

mod common;

use common::{await_convergence, expected_owner, ring_is_closed, spawn_ring, wait_for};
use std::sync::Arc;
use std::time::Duration;
use veilring::{MemoryNet, Node};

#[tokio::test]
async fn five_nodes_converge_to_one_cycle() {
    let net = MemoryNet::new();
    let nodes = spawn_ring(&net, 5).await;
    await_convergence(&nodes).await;

    // Every node also settles on a predecessor.
    let nodes_ref = &nodes;
    let settled = wait_for(Duration::from_secs(10), move || async move {
        for node in nodes_ref {
            match node.predecessor().await {
                Ok(Some(_)) => {}
                _ => return false,
            }
        }
        true
    })
    .await;
    assert!(settled, "some node never adopted a predecessor");

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn all_nodes_agree_on_key_ownership() {
    let net = MemoryNet::new();
    let nodes = spawn_ring(&net, 5).await;
    await_convergence(&nodes).await;

    for key in [b"alpha".as_slice(), b"beta", b"gamma", b"delta"] {
        let expected = expected_owner(&nodes, key);
        for node in &nodes {
            let owner = node.locate(key).await.expect("lookup failed");
            assert_eq!(
                owner.id, expected,
                "node {} resolved {:?} to the wrong owner",
                node.node_id(),
                String::from_utf8_lossy(key)
            );
        }
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn lookups_resolve_within_the_hop_bound() {
    let net = MemoryNet::new();
    let nodes = spawn_ring(&net, 5).await;
    await_convergence(&nodes).await;

    // With 5 members a lookup resolves in at most ceil(log2(8)) + 1 = 4
    // remote hops, even before the finger tables fill in: the worst case
    // walks successor pointers around the ring.
    let bound = 4;
    for key in [b"alpha".as_slice(), b"beta", b"gamma", b"delta", b"epsilon"] {
        let expected = expected_owner(&nodes, key);
        let (owner, hops) = nodes[0].locate_traced(key).await.expect("lookup failed");
        assert_eq!(owner.id, expected);
        assert!(
            hops <= bound,
            "{:?} took {hops} hops, budget is {bound}",
            String::from_utf8_lossy(key)
        );
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn singleton_node_is_immediately_usable() {
    let net = MemoryNet::new();
    let node = Node::bind(Arc::new(net.transport()), common::fast_config())
        .await
        .unwrap();

    // Alone on the ring, the node owns every key.
    let owner = node.locate(b"anything").await.unwrap();
    assert_eq!(owner.id, node.node_id());
    assert_eq!(node.successor().await.unwrap().id, node.node_id());

    node.put(b"k", b"v".to_vec()).await.unwrap();
    assert_eq!(node.get(b"k").await.unwrap(), Some(b"v".to_vec()));

    node.shutdown().await;
}

#[tokio::test]
async fn ring_heals_after_member_failure() {
    let net = MemoryNet::new();
    let mut nodes = spawn_ring(&net, 4).await;
    await_convergence(&nodes).await;

    // Kill a non-bootstrap member and cut its address off the network.
    let victim = nodes.remove(2);
    let victim_addr = victim.onion_host().to_string();
    victim.shutdown().await;
    net.partition(&victim_addr).await;

    let nodes_ref = &nodes;
    let healed = wait_for(Duration::from_secs(20), move || ring_is_closed(nodes_ref)).await;
    assert!(healed, "ring did not close around the failed member");

    // Lookups resolve again, now excluding the dead node. Fingers may
    // briefly still point at it, so allow a few rounds to scrub.
    let gone = victim_addr.as_str();
    let clean = wait_for(Duration::from_secs(10), move || async move {
        for node in nodes_ref {
            match node.locate(b"post-failure").await {
                Ok(owner) if owner.addr != gone => {}
                _ => return false,
            }
        }
        true
    })
    .await;
    assert!(clean, "lookups kept resolving to the failed member");

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn join_through_any_member_works() {
    let net = MemoryNet::new();
    let nodes = spawn_ring(&net, 3).await;
    await_convergence(&nodes).await;

    // New node joins through the last member rather than the bootstrap.
    let late = Node::bind(Arc::new(net.transport()), common::fast_config())
        .await
        .unwrap();
    late.join(nodes[2].onion_host()).await.unwrap();

    let mut all: Vec<Node> = nodes;
    all.push(late);
    await_convergence(&all).await;

    for node in &all {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn joining_own_address_is_rejected() {
    let net = MemoryNet::new();
    let node = Node::bind(Arc::new(net.transport()), common::fast_config())
        .await
        .unwrap();
    let own = node.onion_host().to_string();
    assert!(node.join(&own).await.is_err());
    node.shutdown().await;
}
