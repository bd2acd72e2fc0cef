//! Broadcast tests: flooded messages reach every other member exactly once,
//! and a dead peer does not block delivery to the rest.

mod common;

use common::{await_connected_peers, await_convergence, spawn_ring};
use std::time::Duration;
use tokio::sync::mpsc;
use veilring::{MemoryNet, Message};

async fn recv_within(rx: &mut mpsc::Receiver<Message>, deadline: Duration) -> Option<Message> {
    tokio::time::timeout(deadline, rx.recv()).await.ok().flatten()
}

#[tokio::test]
async fn broadcast_reaches_every_other_node_once() {
    let net = MemoryNet::new();
    let nodes = spawn_ring(&net, 3).await;
    await_convergence(&nodes).await;
    // Fanout follows established connections; stabilization traffic builds
    // them up within a few rounds.
    assert!(await_connected_peers(&nodes[0], 2).await);

    let mut receivers = Vec::new();
    for node in &nodes {
        receivers.push(node.messages().await.expect("messages already taken"));
    }

    assert!(nodes[0].broadcast("alice", "hello ring").await);

    // Every node except the sender delivers the message exactly once.
    for (i, rx) in receivers.iter_mut().enumerate() {
        if i == 0 {
            continue;
        }
        let message = recv_within(rx, Duration::from_secs(5))
            .await
            .unwrap_or_else(|| panic!("node {i} never received the broadcast"));
        assert_eq!(message.username, "alice");
        assert_eq!(message.body, "hello ring");
        assert_eq!(message.origin, nodes[0].node_id());
        assert!(
            recv_within(rx, Duration::from_millis(300)).await.is_none(),
            "node {i} received a duplicate"
        );
    }
    // The sender does not hear its own message back.
    assert!(recv_within(&mut receivers[0], Duration::from_millis(300))
        .await
        .is_none());

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn distinct_messages_all_arrive() {
    let net = MemoryNet::new();
    let nodes = spawn_ring(&net, 2).await;
    await_convergence(&nodes).await;
    assert!(await_connected_peers(&nodes[0], 1).await);

    let mut rx = nodes[1].messages().await.unwrap();
    for i in 0..5 {
        assert!(nodes[0].broadcast("bob", &format!("message {i}")).await);
    }

    let mut bodies = Vec::new();
    for _ in 0..5 {
        let message = recv_within(&mut rx, Duration::from_secs(5))
            .await
            .expect("missing broadcast");
        bodies.push(message.body);
    }
    for i in 0..5 {
        assert!(bodies.contains(&format!("message {i}")));
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn dead_peer_does_not_block_the_flood() {
    let net = MemoryNet::new();
    let mut nodes = spawn_ring(&net, 3).await;
    await_convergence(&nodes).await;
    assert!(await_connected_peers(&nodes[0], 2).await);

    let mut live_rx = nodes[1].messages().await.unwrap();

    // Kill the third node without giving the others time to notice.
    let victim = nodes.remove(2);
    let victim_addr = victim.onion_host().to_string();
    victim.shutdown().await;
    net.partition(&victim_addr).await;

    assert!(nodes[0].broadcast("carol", "still here").await);

    let message = recv_within(&mut live_rx, Duration::from_secs(10))
        .await
        .expect("live peer never received the broadcast");
    assert_eq!(message.body, "still here");

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn messages_stream_can_only_be_taken_once() {
    let net = MemoryNet::new();
    let node = veilring::Node::bind(
        std::sync::Arc::new(net.transport()),
        common::fast_config(),
    )
    .await
    .unwrap();

    assert!(node.messages().await.is_some());
    assert!(node.messages().await.is_none());
    node.shutdown().await;
}

#[tokio::test]
async fn broadcast_without_peers_succeeds_quietly() {
    let net = MemoryNet::new();
    let node = veilring::Node::bind(
        std::sync::Arc::new(net.transport()),
        common::fast_config(),
    )
    .await
    .unwrap();

    // A singleton has nobody to flood to; publishing still succeeds.
    assert!(node.broadcast("dave", "anyone out there?").await);
    node.shutdown().await;
}
