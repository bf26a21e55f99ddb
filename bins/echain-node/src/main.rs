//! EChain node binary.
//!
//! Starts a full, miner or SPV node listening on a TCP address, greets the
//! bootstrap peers and runs until Ctrl+C.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use echain_core::address::Address;
use echain_core::constants::{DEFAULT_DIFFICULTY_BITS, NodeRole};
use echain_network::NetworkConfig;
use echain_node_lib::{Node, NodeConfig};
use tracing::info;

/// EChain node.
#[derive(Parser, Debug)]
#[command(name = "echain-node", version, about = "EChain proof-of-work node")]
struct Args {
    /// P2P listen address (host:port)
    #[arg(long, default_value = "127.0.0.1:8333")]
    listen: String,

    /// Node role: fullnode, miner or spv
    #[arg(long, default_value = "fullnode")]
    role: NodeRole,

    /// Data directory for chain storage
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Bootstrap peers (comma-separated host:port)
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Address receiving block rewards (required for miners)
    #[arg(long)]
    reward_address: Option<Address>,

    /// Address receiving the genesis coinbase
    #[arg(long)]
    genesis_address: Option<Address>,

    /// Leading zero bits required of block hashes
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY_BITS)]
    difficulty_bits: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    /// Convert CLI args into a NodeConfig.
    fn into_config(self) -> (NodeConfig, String) {
        let defaults = NodeConfig::default();

        // Each listen address gets its own directory so several nodes can
        // share a machine.
        let data_dir = self
            .data_dir
            .unwrap_or_else(|| defaults.data_dir.join(self.listen.replace(':', "_")));

        let network = NetworkConfig {
            bootstrap_peers: self.peers,
            ..NetworkConfig::default()
        };

        let config = NodeConfig {
            role: self.role,
            listen_addr: self.listen,
            data_dir,
            reward_address: self.reward_address,
            genesis_address: self.genesis_address.unwrap_or(defaults.genesis_address),
            difficulty_bits: self.difficulty_bits,
            log_level: self.log_level,
            network,
            ..defaults
        };

        (config, self.log_format)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, log_format) = Args::parse().into_config();
    init_logging(&config.log_level, &log_format);

    info!("EChain node v{}", env!("CARGO_PKG_VERSION"));
    info!(role = %config.role, listen = %config.listen_addr, data_dir = ?config.data_dir, "configuration");
    info!(peers = ?config.network.bootstrap_peers, difficulty_bits = config.difficulty_bits, "network");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let (node, server) = Node::start(config).await.context("starting node")?;
    info!(
        address = node.address(),
        height = node.best_height().context("reading chain height")?,
        "node running (Ctrl+C to stop)"
    );

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl+C handler")?;
    info!("received Ctrl+C, shutting down");

    node.shutdown();
    server.await.context("waiting for the accept loop")?;
    info!("shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG` overrides the level. Pass `format = "json"` for structured JSON
/// output; any other value gives human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
