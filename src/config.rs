//! Node configuration.
//!
//! All tunables with production defaults. Tests shrink the intervals to keep
//! convergence fast; production deployments mostly take the defaults.

use std::time::Duration;

/// Configuration for a veilring node.
#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// Human-readable name attached to outbound broadcasts.
    pub client_name: String,
    /// Version string reported in `client_info`.
    pub client_version: String,
    /// Cap on established peer connections. Exceeding it evicts the
    /// least-recently-active peer.
    pub max_peers: usize,
    /// Cap on concurrent in-flight connection attempts.
    pub max_pending_peers: usize,
    /// How often the stabilizer runs one round (predecessor check, notify,
    /// one finger refresh).
    pub stabilize_interval: Duration,
    /// Deadline for a single dial plus request round trip.
    pub connect_timeout: Duration,
    /// Hop budget for an iterative successor lookup.
    pub lookup_hops: usize,
    /// Peers silent for longer than this are pruned from the registry.
    pub prune_after: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            client_name: "anonymous".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            max_peers: 64,
            max_pending_peers: 16,
            stabilize_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            lookup_hops: 32,
            prune_after: Duration::from_secs(300),
        }
    }
}

impl OverlayConfig {
    /// `name version` string for logs and status displays.
    pub fn client_info(&self) -> String {
        format!("{} {}", self.client_name, self.client_version)
    }
}
