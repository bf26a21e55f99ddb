//! Network configuration for the EChain P2P layer.

use std::time::Duration;

use echain_core::constants::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION};

/// Default upper bound on a single message (32 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = MAX_MESSAGE_SIZE;

/// Configuration shared by every connection a node makes or accepts.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Version sent in `version`; peers with a different one are ignored.
    pub protocol_version: u32,
    /// Peers to greet with `version` on startup, as `host:port`.
    pub bootstrap_peers: Vec<String>,
    /// Wait before greeting the bootstrap peers.
    pub bootstrap_delay: Duration,
    /// Timeout for outbound connection attempts.
    pub dial_timeout: Duration,
    /// Timeout for reading a full message or reply.
    pub request_timeout: Duration,
    pub max_message_size: usize,
    /// Hashes per `getdata` batch during catch-up.
    pub max_blocks_in_transit: usize,
    /// Hashes per `inv` reply.
    pub max_inv_hashes: usize,
    /// Headers per `headers` reply.
    pub max_headers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            bootstrap_peers: Vec::new(),
            bootstrap_delay: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_blocks_in_transit: 10,
            max_inv_hashes: 500,
            max_headers: 2000,
        }
    }
}

impl NetworkConfig {
    /// Short timings for nodes talking over localhost in tests.
    pub fn local() -> Self {
        Self {
            bootstrap_delay: Duration::from_millis(100),
            dial_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }
}
