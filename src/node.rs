//! # High-Level Node API
//!
//! This module provides the main entry point for using veilring. A [`Node`]
//! combines all the underlying components (ring membership, routed storage,
//! broadcast, peer registry) into a single unified interface.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use veilring::{Node, OverlayConfig, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(TcpTransport::new("127.0.0.1:0"));
//!     let node = Node::bind(transport, OverlayConfig::default()).await?;
//!
//!     // Join an existing ring, store a value, say hello.
//!     node.join("203.0.113.7:9000").await?;
//!     node.put(b"greeting", b"hello ring".to_vec()).await?;
//!     node.broadcast("alice", "hello everyone").await;
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Lifecycle
//!
//! [`Node::bind`] starts every component: the listener, the RPC actor, the
//! ring actor with its stabilizer, the local store with its migration loop,
//! and the broadcaster. A fresh node is a singleton ring that is immediately
//! usable; [`Node::join`] splices it into an existing ring through any
//! member. [`Node::shutdown`] stops the components in reverse dependency
//! order.

use crate::broadcast::Broadcaster;
use crate::config::OverlayConfig;
use crate::identity::{NodeId, PeerInfo};
use crate::keystore::{Ed25519KeyStore, KeyStore};
use crate::messages::Message;
use crate::registry::{Peer, Registry, RegistryEvent};
use crate::ring::{spawn_stabilizer, Ring, RingEvent};
use crate::router::Router;
use crate::rpc::{spawn_server, RpcNode};
use crate::store::{Dht, LocalStore};
use crate::transport::Transport;
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receiver that can be taken exactly once by the application.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

/// A running overlay node.
pub struct Node {
    config: OverlayConfig,
    self_info: PeerInfo,
    keystore: Arc<Ed25519KeyStore>,
    registry: Registry,
    rpc: Arc<RpcNode>,
    ring: Ring<RpcNode>,
    router: Router<RpcNode>,
    dht: Dht<RpcNode>,
    broadcaster: Broadcaster,
    messages: TakeOnce<Message>,
    server: JoinHandle<()>,
    stabilizer: JoinHandle<()>,
    migrator: JoinHandle<()>,
    evictor: JoinHandle<()>,
}

impl Node {
    /// Start a node on the given transport. The node comes up as a
    /// singleton ring and serves requests immediately.
    pub async fn bind(transport: Arc<dyn Transport>, config: OverlayConfig) -> Result<Self> {
        let (addr, listener) = transport.listen().await?;
        let self_info = PeerInfo::from_addr(addr);
        info!(id = %self_info.id, addr = %self_info.addr, "node starting");

        let keystore = Arc::new(Ed25519KeyStore::generate());
        let (registry, registry_events) = Registry::spawn(
            config.max_peers,
            config.max_pending_peers,
            config.prune_after,
        );
        let rpc = Arc::new(RpcNode::spawn(
            transport,
            self_info.clone(),
            registry.clone(),
            config.connect_timeout,
        ));
        let (ring, ring_events) = Ring::spawn(self_info.clone(), rpc.clone());
        let router = Router::new(ring.clone(), config.lookup_hops);
        let store = LocalStore::spawn(self_info.id);
        let dht = Dht::new(router.clone(), store.clone(), rpc.clone(), self_info.clone());
        let (broadcaster, messages_rx) = Broadcaster::spawn(
            rpc.clone(),
            registry.clone(),
            self_info.clone(),
            config.connect_timeout,
        );

        let server = spawn_server(
            listener,
            ring.clone(),
            store,
            broadcaster.clone(),
            registry.clone(),
        );
        let migrator = spawn_migrator(ring_events, dht.clone());
        let evictor = spawn_evictor(registry_events, rpc.clone());
        let stabilizer =
            spawn_stabilizer(ring.clone(), router.clone(), config.stabilize_interval);

        Ok(Self {
            config,
            self_info,
            keystore,
            registry,
            rpc,
            ring,
            router,
            dht,
            broadcaster,
            messages: Mutex::new(Some(messages_rx)),
            server,
            stabilizer,
            migrator,
            evictor,
        })
    }

    pub fn client_name(&self) -> &str {
        &self.config.client_name
    }

    pub fn client_version(&self) -> &str {
        &self.config.client_version
    }

    /// `name version` string for status displays.
    pub fn client_info(&self) -> String {
        self.config.client_info()
    }

    /// The stable transport address peers dial to reach this node.
    pub fn onion_host(&self) -> &str {
        &self.self_info.addr
    }

    pub fn node_id(&self) -> NodeId {
        self.self_info.id
    }

    pub fn max_peers(&self) -> usize {
        self.config.max_peers
    }

    pub fn max_pending_peers(&self) -> usize {
        self.config.max_pending_peers
    }

    /// Application key material for signing and sealing payloads.
    pub fn keystore(&self) -> &Arc<Ed25519KeyStore> {
        &self.keystore
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.keystore.public_key()
    }

    /// Every peer the registry knows about, with connection state.
    pub async fn peers(&self) -> Vec<Peer> {
        self.registry.snapshot().await
    }

    pub async fn successor(&self) -> Result<PeerInfo> {
        self.ring.successor().await
    }

    pub async fn predecessor(&self) -> Result<Option<PeerInfo>> {
        self.ring.predecessor().await
    }

    /// Populated finger table entries as `(index, peer)` pairs.
    pub async fn finger_table(&self) -> Result<Vec<(usize, PeerInfo)>> {
        Ok(self.ring.snapshot().await?.fingers)
    }

    /// Join an existing ring through any member and wait for the splice.
    pub async fn join(&self, bootstrap_addr: &str) -> Result<()> {
        if bootstrap_addr == self.self_info.addr {
            bail!("cannot join through our own address");
        }
        let bootstrap = PeerInfo::from_addr(bootstrap_addr);
        self.registry.observe(bootstrap.clone()).await;
        self.ring.join(bootstrap).await
    }

    /// Fire-and-forget connection attempt. Returns `false` only when the
    /// address is obviously unusable; the attempt itself runs in the
    /// background and surfaces through the peer list.
    pub fn connect_to_peer(&self, addr: &str) -> bool {
        if addr.is_empty() || addr == self.self_info.addr {
            return false;
        }
        let addr = addr.to_string();
        let rpc = self.rpc.clone();
        let ring = self.ring.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let peer = PeerInfo::from_addr(addr);
            registry.observe(peer.clone()).await;
            match crate::protocols::RingRpc::ping(&*rpc, &peer).await {
                Ok(()) => {
                    // First contact of a singleton doubles as a join.
                    match ring.snapshot().await {
                        Ok(snap) if snap.is_singleton() => {
                            if let Err(e) = ring.join(peer).await {
                                warn!(error = %e, "background join failed");
                            }
                        }
                        _ => {}
                    }
                }
                Err(e) => debug!(to = %peer.addr, error = %e, "connection attempt failed"),
            }
        });
        true
    }

    /// Liveness-probe a peer by address.
    pub async fn ping(&self, addr: &str) -> Result<()> {
        let peer = PeerInfo::from_addr(addr);
        crate::protocols::RingRpc::ping(&*self.rpc, &peer).await
    }

    /// Flood a message to the overlay. Returns `false` when the node is
    /// shutting down.
    pub async fn broadcast(&self, username: &str, body: &str) -> bool {
        let message = Message::new(username, body, self.self_info.id);
        self.broadcaster.publish(message).await
    }

    /// Take the stream of broadcast messages delivered to this node.
    /// Returns `None` after the first call.
    pub async fn messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.messages.lock().await.take()
    }

    /// Store `value` under `key` on the responsible node.
    pub async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.dht.put(key, value).await
    }

    /// Fetch the value stored under `key`.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.dht.get(key).await
    }

    /// Remove the value stored under `key`, returning it if present.
    pub async fn delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.dht.delete(key).await
    }

    /// Resolve a key to the peer responsible for it.
    pub async fn locate(&self, key: &[u8]) -> Result<PeerInfo> {
        self.router.locate(key).await
    }

    /// [`Node::locate`] plus the number of remote hops the lookup took,
    /// for diagnostics.
    pub async fn locate_traced(&self, key: &[u8]) -> Result<(PeerInfo, usize)> {
        self.router.locate_traced(key).await
    }

    /// Components all start inside [`Node::bind`]; this exists for symmetry
    /// with [`Node::shutdown`] and is an idempotent no-op.
    pub fn start(&self) {}

    /// Stop every component in reverse dependency order.
    pub async fn shutdown(&self) {
        info!(id = %self.self_info.id, "node shutting down");
        self.stabilizer.abort();
        self.migrator.abort();
        self.evictor.abort();
        self.server.abort();
        self.broadcaster.quit().await;
        self.dht.local().quit().await;
        self.ring.quit().await;
        self.rpc.quit().await;
        self.registry.quit().await;
    }
}

/// Forwards predecessor changes from the ring to the storage layer, which
/// migrates the records the new predecessor now owns.
fn spawn_migrator(
    mut events: mpsc::Receiver<RingEvent>,
    dht: Dht<RpcNode>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RingEvent::PredecessorChanged { new } => {
                    if let Err(e) = dht.handle_predecessor_change(new).await {
                        debug!(error = %e, "record migration deferred");
                    }
                }
            }
        }
    })
}

/// Tears down the pooled circuit of any peer the registry evicts, so an
/// unreferenced connection does not linger past its registry entry.
fn spawn_evictor(
    mut events: mpsc::Receiver<RegistryEvent>,
    rpc: Arc<RpcNode>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RegistryEvent::Evicted(peer) => {
                    debug!(peer = %peer.id, "closing circuit to evicted peer");
                    rpc.drop_connection(&peer.addr).await;
                }
            }
        }
    })
}
