//! # Pluggable Overlay Transport
//!
//! The overlay never talks to raw sockets directly. Everything flows through
//! the [`Transport`] trait, which models the anonymizing layer beneath the
//! ring: it hands out a stable listening address (an onion-style service
//! name) and dials opaque addresses into framed byte streams.
//!
//! Two implementations ship with the crate:
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`TcpTransport`] | Plain TCP, for development and deployment behind a local SOCKS bridge |
//! | [`MemoryNet`] | In-process network for tests; many transports share one net |
//!
//! ## Framing
//!
//! Connections exchange length-prefixed frames: a u32 big-endian length
//! followed by that many payload bytes. Frames above
//! [`MAX_FRAME_SIZE`](crate::messages::MAX_FRAME_SIZE) are rejected before
//! allocation.

use crate::messages::MAX_FRAME_SIZE;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

/// A bidirectional framed byte stream between two overlay nodes.
#[async_trait]
pub trait Connection: Send {
    /// Write one frame. Completes when the frame is handed to the transport.
    async fn send_frame(&mut self, payload: &[u8]) -> Result<()>;

    /// Read the next frame. `Ok(None)` means the peer closed cleanly.
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Accepts inbound connections on a transport's listening address.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Box<dyn Connection>>;
}

/// The seam between the ring and whatever carries its bytes.
///
/// Addresses are opaque strings owned by the transport. The overlay derives
/// node identities from them but never parses them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening. Returns the stable address peers should dial,
    /// and the listener for inbound connections.
    async fn listen(&self) -> Result<(String, Box<dyn Listener>)>;

    /// Open a connection to a peer's listening address.
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>>;
}

/// Length-prefixed framing over any async byte stream.
pub struct FramedStream<T> {
    inner: T,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FramedStream<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for FramedStream<T> {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            bail!("frame too large: {} bytes", payload.len());
        }
        self.inner
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .context("failed to write frame length")?;
        self.inner
            .write_all(payload)
            .await
            .context("failed to write frame body")?;
        self.inner.flush().await.context("failed to flush frame")?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("failed to read frame length"),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            bail!("incoming frame too large: {len} bytes");
        }
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .context("failed to read frame body")?;
        Ok(Some(buf))
    }
}

/// TCP transport. The listening address is the local socket address, which
/// stands in for an onion service name during development.
pub struct TcpTransport {
    bind_addr: String,
}

impl TcpTransport {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> Result<Box<dyn Connection>> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .context("failed to accept tcp connection")?;
        Ok(Box::new(FramedStream::new(stream)))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self) -> Result<(String, Box<dyn Listener>)> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.bind_addr))?;
        let addr = listener
            .local_addr()
            .context("failed to read local address")?
            .to_string();
        Ok((addr, Box::new(TcpAcceptor { listener })))
    }

    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        Ok(Box::new(FramedStream::new(stream)))
    }
}

type InboundSender = mpsc::Sender<Box<dyn Connection>>;

/// An in-process network shared by several [`MemoryTransport`]s. Each call to
/// [`MemoryNet::transport`] produces one endpoint; dialing routes a duplex
/// pipe to the matching listener.
#[derive(Clone, Default)]
pub struct MemoryNet {
    listeners: Arc<Mutex<HashMap<String, InboundSender>>>,
    next_host: Arc<AtomicU64>,
}

impl MemoryNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport endpoint with a fresh synthetic onion-style address.
    pub fn transport(&self) -> MemoryTransport {
        let n = self.next_host.fetch_add(1, Ordering::Relaxed);
        MemoryTransport {
            net: self.clone(),
            host: format!("mem-{n:04}.onion:9000"),
        }
    }

    /// Create a transport endpoint with an explicit address, for tests that
    /// need control over ring positions.
    pub fn transport_at(&self, host: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            net: self.clone(),
            host: host.into(),
        }
    }

    /// Drop the listener for an address, simulating node death. Established
    /// pipes to that node stay open until their tasks drop them.
    pub async fn partition(&self, addr: &str) {
        self.listeners.lock().await.remove(addr);
    }
}

/// One endpoint on a [`MemoryNet`].
pub struct MemoryTransport {
    net: MemoryNet,
    host: String,
}

struct MemoryAcceptor {
    inbound: mpsc::Receiver<Box<dyn Connection>>,
}

#[async_trait]
impl Listener for MemoryAcceptor {
    async fn accept(&mut self) -> Result<Box<dyn Connection>> {
        match self.inbound.recv().await {
            Some(conn) => Ok(conn),
            None => bail!("memory listener closed"),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self) -> Result<(String, Box<dyn Listener>)> {
        let (tx, rx) = mpsc::channel(32);
        let mut listeners = self.net.listeners.lock().await;
        if listeners.contains_key(&self.host) {
            bail!("address already in use: {}", self.host);
        }
        listeners.insert(self.host.clone(), tx);
        Ok((self.host.clone(), Box::new(MemoryAcceptor { inbound: rx })))
    }

    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let sender = {
            let listeners = self.net.listeners.lock().await;
            listeners.get(addr).cloned()
        };
        let Some(sender) = sender else {
            bail!("no such host: {addr}");
        };
        let (near, far) = tokio::io::duplex(MAX_FRAME_SIZE + 4);
        sender
            .send(Box::new(FramedStream::new(far)))
            .await
            .map_err(|_| anyhow::anyhow!("listener for {addr} is gone"))?;
        Ok(Box::new(FramedStream::new(near)))
    }
}
