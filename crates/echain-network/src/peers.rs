//! Table of connected peers and address-gossip bookkeeping.

use std::collections::HashSet;

use echain_core::constants::NodeRole;

/// A peer that completed the version/verack handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub role: NodeRole,
    pub address: String,
}

/// Not thread-safe; the node wraps it in a `Mutex`.
#[derive(Debug, Default)]
pub struct PeerTable {
    connected: Vec<Peer>,
    /// Addresses already flooded via `addr`.
    forwarded: HashSet<String>,
    /// Addresses we have sent `version` to.
    handshaking: HashSet<String>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connected peer. Returns false if it was already known.
    pub fn add(&mut self, peer: Peer) -> bool {
        self.handshaking.remove(&peer.address);
        if self.is_connected(&peer.address) {
            return false;
        }
        self.connected.push(peer);
        true
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connected.iter().any(|p| p.address == address)
    }

    pub fn role_of(&self, address: &str) -> Option<NodeRole> {
        self.connected
            .iter()
            .find(|p| p.address == address)
            .map(|p| p.role)
    }

    /// Note that we sent `version` to `address`. Returns false if a
    /// handshake was already underway or the peer is connected.
    pub fn begin_handshake(&mut self, address: &str) -> bool {
        if self.is_connected(address) {
            return false;
        }
        self.handshaking.insert(address.to_string())
    }

    pub fn is_known(&self, address: &str) -> bool {
        self.is_connected(address) || self.handshaking.contains(address)
    }

    /// Returns true the first time `address` is seen for forwarding.
    pub fn mark_forwarded(&mut self, address: &str) -> bool {
        self.forwarded.insert(address.to_string())
    }

    /// Addresses of connected peers whose role passes `filter`.
    pub fn with_role(&self, filter: impl Fn(NodeRole) -> bool) -> Vec<String> {
        self.connected
            .iter()
            .filter(|p| filter(p.role))
            .map(|p| p.address.clone())
            .collect()
    }

    /// Connected full and miner peers.
    pub fn block_peers(&self) -> Vec<String> {
        self.with_role(|r| r.stores_blocks())
    }

    pub fn spv_peers(&self) -> Vec<String> {
        self.with_role(|r| r == NodeRole::Spv)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.with_role(|_| true)
    }

    pub fn peers(&self) -> &[Peer] {
        &self.connected
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(role: NodeRole, address: &str) -> Peer {
        Peer {
            role,
            address: address.to_string(),
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut table = PeerTable::new();
        assert!(table.add(peer(NodeRole::Full, "a:1")));
        assert!(!table.add(peer(NodeRole::Full, "a:1")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn role_filters() {
        let mut table = PeerTable::new();
        table.add(peer(NodeRole::Full, "a:1"));
        table.add(peer(NodeRole::Miner, "b:1"));
        table.add(peer(NodeRole::Spv, "c:1"));
        assert_eq!(table.block_peers(), vec!["a:1", "b:1"]);
        assert_eq!(table.spv_peers(), vec!["c:1"]);
        assert_eq!(table.role_of("b:1"), Some(NodeRole::Miner));
        assert_eq!(table.role_of("z:1"), None);
    }

    #[test]
    fn handshake_tracking() {
        let mut table = PeerTable::new();
        assert!(table.begin_handshake("a:1"));
        assert!(!table.begin_handshake("a:1"));
        assert!(table.is_known("a:1"));
        assert!(!table.is_connected("a:1"));

        table.add(peer(NodeRole::Full, "a:1"));
        assert!(table.is_connected("a:1"));
        assert!(!table.begin_handshake("a:1"));
    }

    #[test]
    fn forwarded_once() {
        let mut table = PeerTable::new();
        assert!(table.mark_forwarded("a:1"));
        assert!(!table.mark_forwarded("a:1"));
    }
}
