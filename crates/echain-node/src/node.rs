//! Node composition and the behaviour every role shares.
//!
//! [`BaseNode`] owns the configuration, our advertised address and the peer
//! table, and answers the `version`/`verack`/`addr` handshake. [`Node`] picks
//! the role-specific state and dispatches everything else to it. A running
//! node is an [`Arc<Node>`] serving its listener on a background task.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use echain_core::constants::NodeRole;
use echain_core::error::{EchainError, NetworkError};
use echain_core::types::Hash256;
use echain_network::protocol::{AddrMessage, VerackMessage, VersionMessage};
use echain_network::{Message, MessageHandler, NetworkConfig, Peer, PeerTable, broadcast, send_message, serve};

use crate::config::NodeConfig;
use crate::full::FullNode;
use crate::miner::{MinerNode, mining_loop};
use crate::spv::SpvNode;

/// State and handshake logic common to all roles.
pub struct BaseNode {
    config: NodeConfig,
    /// The `host:port` peers should dial to reach us.
    address: String,
    peers: Mutex<PeerTable>,
    shutdown: watch::Sender<bool>,
}

impl BaseNode {
    pub fn new(config: NodeConfig, address: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            address: address.into(),
            peers: Mutex::new(PeerTable::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.config.network
    }

    pub fn role(&self) -> NodeRole {
        self.config.role
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn peers(&self) -> &Mutex<PeerTable> {
        &self.peers
    }

    /// Connected full and miner peers.
    pub fn block_peers(&self) -> Vec<String> {
        self.peers.lock().block_peers()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Best-effort send; failures are logged at debug.
    pub async fn send(&self, addr: &str, message: Message) {
        if let Err(e) = send_message(addr, &message, self.network()).await {
            debug!(peer = addr, command = message.command(), "send failed: {e}");
        }
    }

    pub async fn broadcast(&self, addrs: Vec<String>, message: Message) -> usize {
        if addrs.is_empty() {
            return 0;
        }
        broadcast(addrs, &message, self.network()).await
    }

    pub async fn send_version(&self, addr: &str, best_height: u64) {
        let version = VersionMessage {
            version: self.network().protocol_version,
            addr_you: addr.to_string(),
            addr_me: self.address.clone(),
            best_height,
            role: self.role(),
        };
        self.send(addr, Message::Version(version)).await;
    }

    /// Greet every bootstrap peer other than ourselves.
    pub async fn bootstrap(&self, best_height: u64) {
        tokio::time::sleep(self.network().bootstrap_delay).await;
        let targets: Vec<String> = {
            let mut peers = self.peers.lock();
            self.network()
                .bootstrap_peers
                .iter()
                .filter(|addr| **addr != self.address && **addr != self.config.listen_addr)
                .filter(|addr| peers.begin_handshake(addr))
                .cloned()
                .collect()
        };
        for addr in targets {
            info!(peer = %addr, "greeting bootstrap peer");
            self.send_version(&addr, best_height).await;
        }
    }

    async fn handle_version(&self, version: VersionMessage, best_height: u64) {
        if version.version != self.network().protocol_version {
            debug!(peer = %version.addr_me, theirs = version.version, "protocol version mismatch");
            return;
        }
        let verack = VerackMessage {
            role: self.role(),
            addr_from: self.address.clone(),
        };
        self.send(&version.addr_me, Message::Verack(verack)).await;

        let greet_back = self.peers.lock().begin_handshake(&version.addr_me);
        if greet_back {
            self.send_version(&version.addr_me, best_height).await;
        }
    }

    /// Returns the new peer if this `verack` connected it.
    async fn handle_verack(&self, verack: VerackMessage) -> Option<Peer> {
        let peer = Peer {
            role: verack.role,
            address: verack.addr_from,
        };
        if !self.peers.lock().add(peer.clone()) {
            return None;
        }
        info!(peer = %peer.address, role = %peer.role, "peer connected");

        let addr = AddrMessage {
            address: self.address.clone(),
        };
        self.send(&peer.address, Message::Addr(addr)).await;
        Some(peer)
    }

    async fn handle_addr(&self, addr: AddrMessage, best_height: u64) {
        let (greet, forward_to) = {
            let mut peers = self.peers.lock();
            let greet = addr.address != self.address && peers.begin_handshake(&addr.address);
            let forward_to: Vec<String> = if peers.mark_forwarded(&addr.address) {
                peers
                    .addresses()
                    .into_iter()
                    .filter(|peer| *peer != addr.address)
                    .collect()
            } else {
                Vec::new()
            };
            (greet, forward_to)
        };

        if greet {
            self.send_version(&addr.address, best_height).await;
        }
        self.broadcast(forward_to, Message::Addr(addr)).await;
    }
}

/// A node in one of the three roles.
pub enum Node {
    Full(FullNode),
    Miner(MinerNode),
    Spv(SpvNode),
}

impl Node {
    /// Open the role's storage. Nothing is bound or spawned.
    pub fn open(config: NodeConfig, address: impl Into<String>) -> Result<Self, EchainError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| EchainError::Storage(format!("create {}: {e}", config.data_dir.display())))?;

        let base = BaseNode::new(config, address);
        Ok(match base.role() {
            NodeRole::Full => Self::Full(FullNode::open(base)?),
            NodeRole::Miner => Self::Miner(MinerNode::open(base)?),
            NodeRole::Spv => Self::Spv(SpvNode::open(base)?),
        })
    }

    /// Bind the listener, open storage and spawn the accept loop, the
    /// bootstrap greeting and, for miners, the mining loop.
    ///
    /// The returned handle completes when the accept loop stops.
    pub async fn start(config: NodeConfig) -> Result<(Arc<Self>, JoinHandle<()>), EchainError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| NetworkError::Io(format!("bind {}: {e}", config.listen_addr)))?;
        let local: SocketAddr = listener
            .local_addr()
            .map_err(|e| NetworkError::Io(e.to_string()))?;
        let address = advertised_address(&config.listen_addr, local);

        let node = Arc::new(Self::open(config, address)?);
        info!(address = node.address(), role = %node.role(), "starting node");

        let server = tokio::spawn(serve(
            listener,
            Arc::clone(&node),
            node.base().network().clone(),
            node.base().subscribe_shutdown(),
        ));

        let greeter = Arc::clone(&node);
        tokio::spawn(async move {
            match greeter.best_height() {
                Ok(height) => greeter.base().bootstrap(height).await,
                Err(e) => debug!("skipping bootstrap: {e}"),
            }
        });

        if matches!(*node, Self::Miner(_)) {
            tokio::spawn(mining_loop(Arc::clone(&node)));
        }

        Ok((node, server))
    }

    /// Stop mining and the accept loop.
    pub fn shutdown(&self) {
        if let Self::Miner(miner) = self {
            miner.cancel();
        }
        self.base().shutdown.send_replace(true);
        info!(address = self.address(), "node shutting down");
    }

    pub fn base(&self) -> &BaseNode {
        match self {
            Self::Full(node) => node.base(),
            Self::Miner(node) => node.full().base(),
            Self::Spv(node) => node.base(),
        }
    }

    pub fn address(&self) -> &str {
        self.base().address()
    }

    pub fn role(&self) -> NodeRole {
        self.base().role()
    }

    /// The block-storing state, for full and miner nodes.
    pub fn full(&self) -> Option<&FullNode> {
        match self {
            Self::Full(node) => Some(node),
            Self::Miner(node) => Some(node.full()),
            Self::Spv(_) => None,
        }
    }

    pub fn spv(&self) -> Option<&SpvNode> {
        match self {
            Self::Spv(node) => Some(node),
            _ => None,
        }
    }

    pub fn miner(&self) -> Option<&MinerNode> {
        match self {
            Self::Miner(node) => Some(node),
            _ => None,
        }
    }

    /// Length of our chain, genesis included.
    pub fn best_height(&self) -> Result<u64, EchainError> {
        match self {
            Self::Full(node) => node.best_height(),
            Self::Miner(node) => node.full().best_height(),
            Self::Spv(node) => node.best_height(),
        }
    }

    pub fn tip(&self) -> Result<Hash256, EchainError> {
        match self {
            Self::Full(node) => node.tip(),
            Self::Miner(node) => node.full().tip(),
            Self::Spv(node) => node.tip(),
        }
    }

    async fn on_peer_connected(&self, peer: &Peer) -> Result<(), EchainError> {
        match self {
            Self::Full(node) => node.on_peer_connected(peer).await,
            Self::Miner(node) => node.full().on_peer_connected(peer).await,
            Self::Spv(node) => node.on_peer_connected(peer).await,
        }
    }
}

#[async_trait]
impl MessageHandler for Node {
    async fn handle(&self, message: Message) -> Result<Option<Message>, EchainError> {
        match message {
            Message::Version(version) => {
                let height = self.best_height()?;
                self.base().handle_version(version, height).await;
                Ok(None)
            }
            Message::Verack(verack) => {
                if let Some(peer) = self.base().handle_verack(verack).await {
                    self.on_peer_connected(&peer).await?;
                }
                Ok(None)
            }
            Message::Addr(addr) => {
                let height = self.best_height()?;
                self.base().handle_addr(addr, height).await;
                Ok(None)
            }
            other => match self {
                Self::Full(node) => node.handle(other).await,
                Self::Miner(node) => node.full().handle(other).await,
                Self::Spv(node) => node.handle(other).await,
            },
        }
    }
}

/// The address to advertise: the configured one, unless it asked for an
/// ephemeral port.
fn advertised_address(listen_addr: &str, local: SocketAddr) -> String {
    if listen_addr.ends_with(":0") {
        local.to_string()
    } else {
        listen_addr.to_string()
    }
}
