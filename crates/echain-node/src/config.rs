//! Node configuration.
//!
//! [`NodeConfig`] is passed into node construction; there is no ambient
//! global state for addresses or roles.

use std::path::PathBuf;
use std::time::Duration;

use echain_core::address::Address;
use echain_core::constants::{DEFAULT_DIFFICULTY_BITS, DEFAULT_P2P_PORT, NodeRole};
use echain_core::error::EchainError;
use echain_core::genesis::genesis_block;
use echain_core::pow::Target;
use echain_core::types::Block;
use echain_network::NetworkConfig;

/// Configuration for a node of any role.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: NodeRole,
    /// `host:port` to listen on. Port 0 picks a free port at startup.
    pub listen_addr: String,
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Coinbase recipient for mined blocks. Required for miners.
    pub reward_address: Option<Address>,
    /// Recipient of the genesis coinbase; nodes must agree on it.
    pub genesis_address: Address,
    pub difficulty_bits: u32,
    /// Wait before the first mining attempt.
    pub mining_delay: Duration,
    /// Idle time between mining attempts.
    pub mining_interval: Duration,
    /// SPV: wait before asking for a header a proof refers to.
    pub header_wait: Duration,
    pub header_poll_interval: Duration,
    pub header_poll_attempts: u32,
    /// Log level filter string (e.g. "info", "debug", "echain_node_lib=trace").
    pub log_level: String,
    pub network: NetworkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("echain");

        Self {
            role: NodeRole::Full,
            listen_addr: format!("127.0.0.1:{DEFAULT_P2P_PORT}"),
            data_dir,
            reward_address: None,
            genesis_address: Address::genesis(),
            difficulty_bits: DEFAULT_DIFFICULTY_BITS,
            mining_delay: Duration::from_secs(5),
            mining_interval: Duration::from_secs(10),
            header_wait: Duration::from_secs(3),
            header_poll_interval: Duration::from_millis(200),
            header_poll_attempts: 10,
            log_level: "info".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Short timings and low difficulty for nodes in tests.
    pub fn local(role: NodeRole, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            role,
            listen_addr: "127.0.0.1:0".to_string(),
            data_dir: data_dir.into(),
            difficulty_bits: 8,
            mining_delay: Duration::from_millis(200),
            mining_interval: Duration::from_millis(300),
            header_wait: Duration::from_millis(100),
            header_poll_interval: Duration::from_millis(100),
            header_poll_attempts: 20,
            network: NetworkConfig::local(),
            ..Self::default()
        }
    }

    /// Path to the RocksDB block chain.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    /// Path to the RocksDB header chain (SPV).
    pub fn header_db_path(&self) -> PathBuf {
        self.data_dir.join("headers")
    }

    pub fn target(&self) -> Target {
        Target::from_difficulty_bits(self.difficulty_bits)
    }

    /// The genesis block implied by the genesis address and difficulty.
    pub fn genesis(&self) -> Result<Block, EchainError> {
        Ok(genesis_block(self.genesis_address.pubkey_hash(), &self.target())?)
    }

    /// Reject combinations a node cannot start with.
    pub fn validate(&self) -> Result<(), EchainError> {
        if self.role == NodeRole::Miner && self.reward_address.is_none() {
            return Err(EchainError::Config("miner requires a reward address".into()));
        }
        if !(1..=256).contains(&self.difficulty_bits) {
            return Err(EchainError::Config(format!(
                "difficulty bits must be in 1..=256, got {}",
                self.difficulty_bits
            )));
        }
        Ok(())
    }
}
