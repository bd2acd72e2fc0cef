//! # Veilring - Anonymous Ring Overlay Library
//!
//! Veilring provides a ring-structured overlay network built on:
//!
//! - **Identity**: node positions derived by hashing stable onion-style
//!   transport addresses onto a 2^256 identifier ring
//! - **Ring**: successor/predecessor/finger maintenance with periodic
//!   stabilization, converging after churn
//! - **Storage**: a distributed hash table where each key lives on exactly
//!   the node owning its hash, with migration on membership change
//! - **Broadcast**: best-effort flooding with duplicate suppression
//! - **Transport**: pluggable; the overlay only ever sees opaque addresses
//!   and framed streams, so an anonymizing layer slots in underneath
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** extensively for safe concurrent
//! state:
//! - Each component (ring, registry, store, broadcaster, RPC) has a public
//!   Handle and private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! ## Threat Posture
//!
//! Peer identities are self-certifying against their addresses: a node
//! advertising an id that does not hash from its address is rejected at
//! every ingress point. Wire frames and stored values are size-bounded, and
//! peer, connection, and message caches are all capped.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Ring positions, interval math, peer records |
//! | `ring` | Successor/predecessor/finger state and stabilization |
//! | `router` | Iterative hop-bounded lookups |
//! | `store` | Local record store and the routed DHT facade |
//! | `broadcast` | Flood dissemination with dedup |
//! | `registry` | Peer bookkeeping with connection limits |
//! | `keystore` | Ed25519 signing and XChaCha20-Poly1305 sealing |
//! | `protocols` | Protocol trait definitions (RingRpc, etc.) |
//! | `rpc` | Framed request/response layer implementing protocols |
//! | `messages` | Serialization types for the wire protocol |
//! | `transport` | Transport trait, TCP and in-memory implementations |
//! | `config` | Node tunables |

mod broadcast;
mod config;
mod identity;
mod keystore;
mod messages;
mod node;
mod protocols;
mod registry;
mod ring;
mod router;
mod rpc;
mod store;
mod transport;

pub use config::OverlayConfig;
pub use identity::{in_open_closed_interval, in_open_interval, NodeId, PeerInfo, RING_BITS};
pub use keystore::{Ed25519KeyStore, KeyStore};
pub use messages::{KeyRecord, Message, MAX_VALUE_SIZE};
pub use node::Node;
pub use registry::{Peer, PeerState};
pub use router::LookupError;
pub use transport::{
    Connection, FramedStream, Listener, MemoryNet, MemoryTransport, TcpTransport, Transport,
};
