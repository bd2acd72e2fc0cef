//! # RPC Layer
//!
//! This module provides the request/response infrastructure for all veilring
//! protocols. It manages outbound connections, serializes requests onto
//! framed transport streams, and serves inbound requests by dispatching them
//! to the ring, the local store, and the broadcaster.
//!
//! ## Connection Management
//!
//! [`RpcNode`] is an actor behind a cloneable handle. The actor owns an LRU
//! cache of live connections keyed by peer address; each cached connection is
//! driven by its own task that serializes one request/response exchange at a
//! time over the underlying circuit. Dials run in spawned tasks so the actor
//! never blocks; concurrent requests to a peer being dialed queue up and are
//! drained when the dial settles.
//!
//! Connection attempts are gated by the registry's pending-attempt limit, and
//! completed dials move the peer to the Connected state (which may evict the
//! least-recently-active peer when the established cap is hit).
//!
//! ## Serving
//!
//! [`spawn_server`] runs the accept loop. Each inbound connection gets a task
//! that reads framed [`RingRequest`]s, feeds the sender's identity to the
//! registry, and answers with exactly one [`RingResponse`] per request.
//! Handler failures become `RingResponse::Error`, not dropped streams.

use crate::broadcast::Broadcaster;
use crate::identity::{NodeId, PeerInfo};
use crate::messages::{
    deserialize_bounded, serialize_request, serialize_response, KeyRecord, Message, RingRequest,
    RingResponse,
};
use crate::protocols::{BroadcastRpc, FindOutcome, RingRpc, StoreRpc};
use crate::registry::Registry;
use crate::ring::Ring;
use crate::store::LocalStore;
use crate::transport::{Connection, Listener, Transport};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Connections kept warm per node. Covers successor, predecessor, and the
/// hot subset of fingers.
const CONN_CACHE_SIZE: usize = 32;

/// Queue depth of a single connection task.
const CONN_QUEUE: usize = 16;

type Exchange = (RingRequest, oneshot::Sender<Result<RingResponse>>);

/// Sender half of a connection task's queue.
type ConnHandle = mpsc::Sender<Exchange>;

enum Command {
    Connect {
        peer: PeerInfo,
        reply: oneshot::Sender<Result<ConnHandle>>,
    },
    DialFinished {
        peer: PeerInfo,
        result: Result<ConnHandle>,
    },
    Invalidate {
        addr: String,
    },
    Quit(oneshot::Sender<()>),
}

/// Handle to the RPC actor. Implements the protocol traits; clone freely.
#[derive(Clone)]
pub struct RpcNode {
    tx: mpsc::Sender<Command>,
    self_info: PeerInfo,
    request_timeout: Duration,
}

impl RpcNode {
    /// Spawn the connection-manager actor.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        self_info: PeerInfo,
        registry: Registry,
        connect_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let actor = RpcActor {
            rx,
            tx: tx.clone(),
            transport,
            registry,
            connect_timeout,
            conns: LruCache::new(
                NonZeroUsize::new(CONN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
            pending: HashMap::new(),
        };
        tokio::spawn(actor.run());
        Self {
            tx,
            self_info,
            request_timeout: connect_timeout,
        }
    }

    /// This node's own peer record, stamped into every outbound request.
    pub fn self_info(&self) -> &PeerInfo {
        &self.self_info
    }

    /// Drop the pooled connection to an address, if any. The circuit task
    /// exits once its queue sender is gone.
    pub async fn drop_connection(&self, addr: &str) {
        let _ = self
            .tx
            .send(Command::Invalidate {
                addr: addr.to_string(),
            })
            .await;
    }

    /// Stop the actor. Connection tasks die when their queues drop.
    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Send one request and wait for its response. Re-dials once when a
    /// cached connection turns out to be dead.
    pub async fn request(&self, to: &PeerInfo, req: RingRequest) -> Result<RingResponse> {
        for attempt in 0..2 {
            let conn = self.connect(to).await?;
            let (reply_tx, reply_rx) = oneshot::channel();
            if conn.send((req.clone(), reply_tx)).await.is_err() {
                // Connection task exited between cache hit and send.
                trace!(to = %to.addr, attempt, "stale connection, retrying");
                continue;
            }
            match tokio::time::timeout(self.request_timeout, reply_rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => continue,
                Err(_) => bail!("request to {} timed out", to.addr),
            }
        }
        Err(anyhow!("connection to {} kept failing", to.addr))
    }

    async fn connect(&self, to: &PeerInfo) -> Result<ConnHandle> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Connect {
                peer: to.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| anyhow!("rpc node is shut down"))?;
        rx.await.map_err(|_| anyhow!("rpc node is shut down"))?
    }

    fn expect_ack(resp: RingResponse) -> Result<()> {
        match resp {
            RingResponse::Ack => Ok(()),
            RingResponse::Error { message } => Err(anyhow!("remote error: {message}")),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }
}

#[async_trait]
impl RingRpc for RpcNode {
    async fn find_successor(
        &self,
        to: &PeerInfo,
        id: crate::identity::NodeId,
    ) -> Result<FindOutcome> {
        let req = RingRequest::FindSuccessor {
            from: self.self_info.clone(),
            id,
        };
        match self.request(to, req).await? {
            RingResponse::Found(peer) => Ok(FindOutcome::Found(peer)),
            RingResponse::Redirect(peer) => Ok(FindOutcome::Redirect(peer)),
            RingResponse::Error { message } => Err(anyhow!("remote error: {message}")),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    async fn get_predecessor(&self, to: &PeerInfo) -> Result<Option<PeerInfo>> {
        let req = RingRequest::GetPredecessor {
            from: self.self_info.clone(),
        };
        match self.request(to, req).await? {
            RingResponse::Predecessor(pred) => Ok(pred),
            RingResponse::Error { message } => Err(anyhow!("remote error: {message}")),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    async fn notify(&self, to: &PeerInfo) -> Result<()> {
        let req = RingRequest::Notify {
            from: self.self_info.clone(),
        };
        Self::expect_ack(self.request(to, req).await?)
    }

    async fn ping(&self, to: &PeerInfo) -> Result<()> {
        let req = RingRequest::Ping {
            from: self.self_info.clone(),
        };
        Self::expect_ack(self.request(to, req).await?)
    }
}

#[async_trait]
impl StoreRpc for RpcNode {
    async fn put(&self, to: &PeerInfo, record: KeyRecord) -> Result<()> {
        let req = RingRequest::Put {
            from: self.self_info.clone(),
            record,
        };
        Self::expect_ack(self.request(to, req).await?)
    }

    async fn get(&self, to: &PeerInfo, key: crate::identity::NodeId) -> Result<Option<KeyRecord>> {
        let req = RingRequest::Get {
            from: self.self_info.clone(),
            key,
        };
        match self.request(to, req).await? {
            RingResponse::Value(record) => Ok(record),
            RingResponse::Error { message } => Err(anyhow!("remote error: {message}")),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    async fn delete(
        &self,
        to: &PeerInfo,
        key: crate::identity::NodeId,
    ) -> Result<Option<Vec<u8>>> {
        let req = RingRequest::Delete {
            from: self.self_info.clone(),
            key,
        };
        match self.request(to, req).await? {
            RingResponse::Previous(previous) => Ok(previous),
            RingResponse::Error { message } => Err(anyhow!("remote error: {message}")),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    async fn transfer(&self, to: &PeerInfo, records: Vec<KeyRecord>) -> Result<()> {
        let req = RingRequest::Transfer {
            from: self.self_info.clone(),
            records,
        };
        Self::expect_ack(self.request(to, req).await?)
    }
}

#[async_trait]
impl BroadcastRpc for RpcNode {
    async fn broadcast(&self, to: &PeerInfo, message: Message) -> Result<()> {
        let req = RingRequest::Broadcast {
            from: self.self_info.clone(),
            message,
        };
        Self::expect_ack(self.request(to, req).await?)
    }
}

struct RpcActor {
    rx: mpsc::Receiver<Command>,
    tx: mpsc::Sender<Command>,
    transport: Arc<dyn Transport>,
    registry: Registry,
    connect_timeout: Duration,
    conns: LruCache<String, ConnHandle>,
    pending: HashMap<String, Vec<oneshot::Sender<Result<ConnHandle>>>>,
}

impl RpcActor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Connect { peer, reply } => self.connect(peer, reply).await,
                Command::DialFinished { peer, result } => self.dial_finished(peer, result).await,
                Command::Invalidate { addr } => {
                    self.conns.pop(&addr);
                    // A dead circuit means the peer is unreachable right
                    // now; keep the registry's view in sync so the fanout
                    // set drops it immediately.
                    self.registry.mark_disconnected(NodeId::from_addr(&addr)).await;
                }
                Command::Quit(done) => {
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("rpc actor stopped");
    }

    async fn connect(&mut self, peer: PeerInfo, reply: oneshot::Sender<Result<ConnHandle>>) {
        let addr = peer.addr.clone();
        if let Some(conn) = self.conns.get(&addr) {
            if !conn.is_closed() {
                let _ = reply.send(Ok(conn.clone()));
                return;
            }
            self.conns.pop(&addr);
        }
        if let Some(waiters) = self.pending.get_mut(&addr) {
            waiters.push(reply);
            return;
        }

        // Gate new attempts on the registry's pending limit.
        self.registry.observe(peer.clone()).await;
        if let Err(e) = self.registry.mark_connecting(peer.id).await {
            let _ = reply.send(Err(e));
            return;
        }

        self.pending.insert(addr.clone(), vec![reply]);
        let transport = self.transport.clone();
        let timeout = self.connect_timeout;
        let actor_tx = self.tx.clone();
        tokio::spawn(async move {
            let result = dial(transport, &peer.addr, timeout, actor_tx.clone()).await;
            let _ = actor_tx.send(Command::DialFinished { peer, result }).await;
        });
    }

    async fn dial_finished(&mut self, peer: PeerInfo, result: Result<ConnHandle>) {
        let waiters = self.pending.remove(&peer.addr).unwrap_or_default();
        match result {
            Ok(conn) => {
                trace!(to = %peer.addr, "connection established");
                self.registry.mark_connected(peer.id).await;
                self.conns.put(peer.addr.clone(), conn.clone());
                for waiter in waiters {
                    let _ = waiter.send(Ok(conn.clone()));
                }
            }
            Err(e) => {
                debug!(to = %peer.addr, error = %e, "dial failed");
                self.registry.mark_disconnected(peer.id).await;
                for waiter in waiters {
                    let _ = waiter.send(Err(anyhow!("dial {} failed: {e}", peer.addr)));
                }
            }
        }
    }
}

/// Dial a peer and spawn the task that owns the resulting connection.
async fn dial(
    transport: Arc<dyn Transport>,
    addr: &str,
    timeout: Duration,
    actor_tx: mpsc::Sender<Command>,
) -> Result<ConnHandle> {
    let conn = tokio::time::timeout(timeout, transport.dial(addr))
        .await
        .map_err(|_| anyhow!("dial {addr} timed out"))??;
    let (tx, rx) = mpsc::channel(CONN_QUEUE);
    let addr = addr.to_string();
    tokio::spawn(connection_task(conn, rx, addr, timeout, actor_tx));
    Ok(tx)
}

/// Serializes exchanges over one connection: one request in flight per
/// circuit at a time, matching responses by ordering.
async fn connection_task(
    mut conn: Box<dyn Connection>,
    mut rx: mpsc::Receiver<Exchange>,
    addr: String,
    timeout: Duration,
    actor_tx: mpsc::Sender<Command>,
) {
    while let Some((req, reply)) = rx.recv().await {
        let result = exchange(&mut *conn, &req, timeout).await;
        let failed = result.is_err();
        let _ = reply.send(result);
        if failed {
            break;
        }
    }
    let _ = actor_tx.send(Command::Invalidate { addr }).await;
}

async fn exchange(
    conn: &mut dyn Connection,
    req: &RingRequest,
    timeout: Duration,
) -> Result<RingResponse> {
    let payload = serialize_request(req)?;
    conn.send_frame(&payload).await?;
    let frame = tokio::time::timeout(timeout, conn.recv_frame())
        .await
        .map_err(|_| anyhow!("response timed out"))??
        .ok_or_else(|| anyhow!("peer closed the connection"))?;
    deserialize_bounded(&frame)
}

/// Run the accept loop, dispatching inbound requests to the node's
/// components. Returns the listener task; abort it to stop serving.
pub fn spawn_server<N: RingRpc>(
    mut listener: Box<dyn Listener>,
    ring: Ring<N>,
    store: LocalStore,
    broadcaster: Broadcaster,
    registry: Registry,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let ring = ring.clone();
                    let store = store.clone();
                    let broadcaster = broadcaster.clone();
                    let registry = registry.clone();
                    tokio::spawn(serve_connection(conn, ring, store, broadcaster, registry));
                }
                Err(e) => {
                    warn!(error = %e, "listener stopped accepting");
                    break;
                }
            }
        }
    })
}

async fn serve_connection<N: RingRpc>(
    mut conn: Box<dyn Connection>,
    ring: Ring<N>,
    store: LocalStore,
    broadcaster: Broadcaster,
    registry: Registry,
) {
    loop {
        let frame = match conn.recv_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                trace!(error = %e, "inbound connection failed");
                break;
            }
        };
        let req: RingRequest = match deserialize_bounded(&frame) {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "dropping malformed request");
                break;
            }
        };
        let sender = req.sender().clone();
        registry.observe(sender.clone()).await;
        registry.touch(sender.id).await;
        trace!(from = %sender.id, kind = req.kind(), "serving request");

        let resp = match handle_request(req, &ring, &store, &broadcaster).await {
            Ok(resp) => resp,
            Err(e) => RingResponse::Error {
                message: e.to_string(),
            },
        };
        let Ok(payload) = serialize_response(&resp) else {
            break;
        };
        if conn.send_frame(&payload).await.is_err() {
            break;
        }
    }
}

async fn handle_request<N: RingRpc>(
    req: RingRequest,
    ring: &Ring<N>,
    store: &LocalStore,
    broadcaster: &Broadcaster,
) -> Result<RingResponse> {
    match req {
        RingRequest::FindSuccessor { id, .. } => Ok(match ring.handle_find_successor(id).await? {
            FindOutcome::Found(peer) => RingResponse::Found(peer),
            FindOutcome::Redirect(peer) => RingResponse::Redirect(peer),
        }),
        RingRequest::GetPredecessor { .. } => {
            Ok(RingResponse::Predecessor(ring.predecessor().await?))
        }
        RingRequest::Notify { from } => {
            ring.handle_notify(from).await?;
            Ok(RingResponse::Ack)
        }
        RingRequest::Ping { .. } => Ok(RingResponse::Ack),
        RingRequest::Put { record, .. } => {
            store.apply_put(record).await?;
            Ok(RingResponse::Ack)
        }
        RingRequest::Get { key, .. } => Ok(RingResponse::Value(store.get_local(key).await?)),
        RingRequest::Delete { key, .. } => {
            Ok(RingResponse::Previous(store.delete_local(key).await?))
        }
        RingRequest::Transfer { records, .. } => {
            store.transfer_in(records).await?;
            Ok(RingResponse::Ack)
        }
        RingRequest::Broadcast { from, message } => {
            broadcaster.incoming(message, from.id).await;
            Ok(RingResponse::Ack)
        }
    }
}
