//! # Best-Effort Broadcast
//!
//! Floods application messages across the overlay through the established
//! peer set. Every node forwards a message it has not seen before to all of
//! its connected peers except the one it arrived from; a bounded seen-cache
//! keyed by the content hash suppresses duplicates, so each node delivers a
//! given message at most once. Delivery is best effort: partitions and full
//! queues drop messages without retry.
//!
//! The [`Broadcaster`] is an actor; incoming copies and locally published
//! messages run through the same dedup-then-fanout path, keeping per-sender
//! ordering within a single flood.

use crate::identity::{NodeId, PeerInfo};
use crate::messages::{Message, MessageId};
use crate::protocols::BroadcastRpc;
use crate::registry::Registry;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// Message ids remembered for duplicate suppression.
const SEEN_CACHE_SIZE: usize = 1024;

/// Buffered messages awaiting the application before backpressure drops.
const DELIVERY_QUEUE: usize = 256;

enum Command {
    Publish(Message),
    Incoming(Message, NodeId),
    Quit(oneshot::Sender<()>),
}

/// Handle to the broadcast actor. Clone freely.
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<Command>,
}

impl Broadcaster {
    /// Spawn the actor. The returned receiver yields messages delivered to
    /// this node, each exactly once.
    pub fn spawn(
        network: Arc<dyn BroadcastRpc>,
        registry: Registry,
        self_info: PeerInfo,
        send_timeout: Duration,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(256);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE);
        let actor = BroadcastActor {
            rx,
            network,
            registry,
            self_info,
            send_timeout,
            delivery: delivery_tx,
            seen: LruCache::new(NonZeroUsize::new(SEEN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN)),
        };
        tokio::spawn(actor.run());
        (Self { tx }, delivery_rx)
    }

    /// Publish a message originated by this node.
    pub async fn publish(&self, message: Message) -> bool {
        self.tx.send(Command::Publish(message)).await.is_ok()
    }

    /// Feed a message received from a peer into the flood.
    pub async fn incoming(&self, message: Message, from: NodeId) {
        let _ = self.tx.send(Command::Incoming(message, from)).await;
    }

    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct BroadcastActor {
    rx: mpsc::Receiver<Command>,
    network: Arc<dyn BroadcastRpc>,
    registry: Registry,
    self_info: PeerInfo,
    send_timeout: Duration,
    delivery: mpsc::Sender<Message>,
    seen: LruCache<MessageId, ()>,
}

impl BroadcastActor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Publish(message) => {
                    let id = message.message_id();
                    if self.seen.put(id, ()).is_some() {
                        continue;
                    }
                    self.fanout(message, None).await;
                }
                Command::Incoming(message, from) => {
                    let id = message.message_id();
                    if self.seen.put(id, ()).is_some() {
                        trace!(from = %from, "suppressing duplicate broadcast");
                        continue;
                    }
                    // Deliver before forwarding; a full application queue
                    // drops the local copy but still forwards.
                    if self.delivery.try_send(message.clone()).is_err() {
                        debug!("delivery queue full, dropping local copy");
                    }
                    self.fanout(message, Some(from)).await;
                }
                Command::Quit(done) => {
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("broadcast actor stopped");
    }

    /// Forward to every connected peer except the inbound sender and the
    /// message origin. Sends run in parallel under one deadline each; the
    /// actor waits for the batch so floods keep per-sender ordering.
    async fn fanout(&mut self, message: Message, exclude: Option<NodeId>) {
        let peers: Vec<PeerInfo> = self
            .registry
            .connected_peers()
            .await
            .into_iter()
            .filter(|p| p.id != self.self_info.id)
            .filter(|p| Some(p.id) != exclude)
            .filter(|p| p.id != message.origin)
            .collect();
        if peers.is_empty() {
            return;
        }
        trace!(fanout = peers.len(), "forwarding broadcast");
        let mut sends = JoinSet::new();
        for peer in peers {
            let network = self.network.clone();
            let message = message.clone();
            let timeout = self.send_timeout;
            sends.spawn(async move {
                match tokio::time::timeout(timeout, network.broadcast(&peer, message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(to = %peer.addr, error = %e, "broadcast send failed"),
                    Err(_) => debug!(to = %peer.addr, "broadcast send timed out"),
                }
            });
        }
        while sends.join_next().await.is_some() {}
    }
}
