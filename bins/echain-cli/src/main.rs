//! echain-cli — command-line wallet for EChain nodes.
//!
//! Talks to nodes over the P2P protocol: `getutxo` for balances, `newtxn`
//! for transfers and `newaddr` to have SPV nodes watch an address. Keys are
//! printed once by `keygen` and passed back in as hex.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use echain_core::address::Address;
use echain_network::NetworkConfig;
use echain_wallet::{Wallet, WalletClient};

/// EChain command-line wallet.
#[derive(Parser)]
#[command(name = "echain-cli")]
#[command(version, about = "EChain wallet client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a key and print its secret and address.
    Keygen,
    /// Query an address's balance.
    Balance(QueryArgs),
    /// List an address's unspent outputs as JSON.
    Utxos(QueryArgs),
    /// Send coins.
    Transfer(TransferArgs),
    /// Ask SPV nodes to watch an address.
    Monitor(MonitorArgs),
}

#[derive(Args)]
struct NodeArgs {
    /// Full nodes to query (comma-separated host:port).
    #[arg(short, long, value_delimiter = ',', default_value = "127.0.0.1:8333")]
    node: Vec<String>,

    /// Seconds to wait for the first reply.
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

impl NodeArgs {
    fn client(&self) -> WalletClient {
        WalletClient::new(self.node.clone(), NetworkConfig::default())
            .with_reply_timeout(Duration::from_secs(self.timeout))
    }
}

#[derive(Args)]
struct QueryArgs {
    /// Address to query.
    #[arg(short, long)]
    address: Address,

    #[command(flatten)]
    nodes: NodeArgs,
}

#[derive(Args)]
struct TransferArgs {
    /// Sender's hex-encoded secret key, as printed by `keygen`.
    #[arg(short, long)]
    secret: String,

    /// Recipient address.
    #[arg(short, long)]
    to: Address,

    /// Amount to send.
    #[arg(short, long)]
    amount: u64,

    #[command(flatten)]
    nodes: NodeArgs,
}

#[derive(Args)]
struct MonitorArgs {
    /// Address to watch.
    #[arg(short, long)]
    address: Address,

    /// SPV nodes (comma-separated host:port).
    #[arg(long, value_delimiter = ',', required = true)]
    spv: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => keygen(),
        Commands::Balance(args) => balance(args).await,
        Commands::Utxos(args) => utxos(args).await,
        Commands::Transfer(args) => transfer(args).await,
        Commands::Monitor(args) => monitor(args).await,
    }
}

fn keygen() -> Result<()> {
    let wallet = Wallet::generate();
    println!("secret:  {}", wallet.secret_hex());
    println!("address: {}", wallet.address());
    Ok(())
}

async fn balance(args: QueryArgs) -> Result<()> {
    let balance = args
        .nodes
        .client()
        .balance(&args.address)
        .await
        .context("querying balance")?;
    println!("{}: {balance}", args.address);
    Ok(())
}

async fn utxos(args: QueryArgs) -> Result<()> {
    let outputs = args
        .nodes
        .client()
        .get_utxos(&args.address)
        .await
        .context("querying unspent outputs")?;

    let listed: Vec<serde_json::Value> = outputs
        .iter()
        .flat_map(|(txid, outs)| {
            outs.iter().map(move |(index, out)| {
                serde_json::json!({
                    "txid": txid.to_string(),
                    "index": index,
                    "value": out.value,
                    "pubkey_hash": out.locking.pubkey_hash.to_string(),
                })
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&listed)?);
    Ok(())
}

async fn transfer(args: TransferArgs) -> Result<()> {
    if args.amount == 0 {
        bail!("amount must be non-zero");
    }
    let wallet = Wallet::from_secret_hex(&args.secret).context("reading secret key")?;
    let txid = args
        .nodes
        .client()
        .transfer(&wallet, &args.to, args.amount)
        .await
        .context("sending transfer")?;
    println!("sent {} from {} to {}", args.amount, wallet.address(), args.to);
    println!("txid: {txid}");
    Ok(())
}

async fn monitor(args: MonitorArgs) -> Result<()> {
    let delivered = WalletClient::new(Vec::new(), NetworkConfig::default())
        .with_spv_nodes(args.spv)
        .monitor_address(&args.address)
        .await
        .context("sending newaddr")?;
    println!("{} now monitored by {delivered} SPV node(s)", args.address);
    Ok(())
}
