//! Shared test helpers for integration tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use echain_core::address::Address;
use echain_core::constants::NodeRole;
use echain_core::types::{Hash256, PubkeyHash, UnspentOutputs};
use echain_network::NetworkConfig;
use echain_node_lib::storage::BlockChain;
use echain_node_lib::{Node, NodeConfig};
use echain_wallet::WalletClient;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// How long a scenario may wait for the network to settle.
pub const SETTLE: Duration = Duration::from_secs(20);

/// Simple pubkey hash from a seed byte.
pub fn pkh(seed: u8) -> PubkeyHash {
    PubkeyHash([seed; 20])
}

/// A started node with its own data directory. Shut down on drop.
pub struct TestNode {
    pub node: Arc<Node>,
    server: JoinHandle<()>,
    _dir: TempDir,
}

impl TestNode {
    pub fn address(&self) -> String {
        self.node.address().to_string()
    }

    pub fn height(&self) -> u64 {
        self.node.best_height().unwrap()
    }

    pub fn is_connected_to(&self, other: &TestNode) -> bool {
        self.node.base().peers().lock().is_connected(other.node.address())
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.node.shutdown();
        self.server.abort();
    }
}

/// Builder for a node on an ephemeral localhost port.
pub struct NodeBuilder {
    role: NodeRole,
    genesis: Address,
    reward: Option<Address>,
    peers: Vec<String>,
}

impl NodeBuilder {
    pub fn new(role: NodeRole, genesis: Address) -> Self {
        Self {
            role,
            genesis,
            reward: None,
            peers: Vec::new(),
        }
    }

    pub fn reward(mut self, address: Address) -> Self {
        self.reward = Some(address);
        self
    }

    pub fn peer(mut self, node: &TestNode) -> Self {
        self.peers.push(node.address());
        self
    }

    pub async fn start(self) -> TestNode {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::local(self.role, dir.path());
        config.genesis_address = self.genesis;
        config.reward_address = self.reward;
        config.network.bootstrap_peers = self.peers;
        let (node, server) = Node::start(config).await.unwrap();
        TestNode {
            node,
            server,
            _dir: dir,
        }
    }
}

/// A wallet client aimed at `nodes`.
pub fn client(nodes: &[&TestNode]) -> WalletClient {
    WalletClient::new(nodes.iter().map(|n| n.address()).collect(), NetworkConfig::local())
        .with_reply_timeout(Duration::from_secs(5))
}

/// Route node logs to the test harness. `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Sum of the verified outputs an SPV node holds for `address`.
pub fn spv_balance(node: &TestNode, address: &Address) -> u64 {
    let Some(spv) = node.node.spv() else {
        return 0;
    };
    spv.monitor()
        .lock()
        .utxos_for(&address.pubkey_hash())
        .values()
        .flat_map(|outs| outs.values())
        .map(|out| out.value)
        .sum()
}

/// The UTXO index a fresh store builds for the chain of `chain` ending at
/// `tip`.
pub fn rebuilt_utxos(chain: &BlockChain, tip: Hash256) -> BTreeMap<Hash256, UnspentOutputs> {
    let dir = tempfile::tempdir().unwrap();
    let fresh = BlockChain::open(dir.path().join("rebuild")).unwrap();
    for block in chain.iter_from(tip) {
        fresh.put(&block.unwrap()).unwrap();
    }
    fresh.reindex(Some(tip)).unwrap();
    fresh.all_utxos().unwrap()
}

/// Poll `check` every 50ms until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Like [`eventually`] for checks that need to await.
pub async fn eventually_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
