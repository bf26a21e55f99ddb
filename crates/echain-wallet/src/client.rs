//! Talking to running nodes on behalf of a wallet.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info};

use echain_core::address::Address;
use echain_core::types::{Hash256, UnspentOutputs};
use echain_network::protocol::{GetUtxoMessage, NewAddrMessage, NewTxnMessage};
use echain_network::{Message, NetworkConfig, broadcast, request};

use crate::builder::build_transfer;
use crate::error::WalletError;
use crate::wallet::Wallet;

/// Default wait for the first `utxos` reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends wallet requests to a fixed set of full and SPV nodes.
#[derive(Debug, Clone)]
pub struct WalletClient {
    nodes: Vec<String>,
    spv_nodes: Vec<String>,
    network: NetworkConfig,
    reply_timeout: Duration,
}

impl WalletClient {
    pub fn new(nodes: Vec<String>, network: NetworkConfig) -> Self {
        Self {
            nodes,
            spv_nodes: Vec::new(),
            network,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_spv_nodes(mut self, spv_nodes: Vec<String>) -> Self {
        self.spv_nodes = spv_nodes;
        self
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Ask every node for `address`'s unspent outputs; the first `utxos`
    /// reply within the reply timeout wins.
    pub async fn get_utxos(&self, address: &Address) -> Result<BTreeMap<Hash256, UnspentOutputs>, WalletError> {
        let message = Message::GetUtxo(GetUtxoMessage { address: *address });
        let mut tasks = JoinSet::new();
        for node in &self.nodes {
            let node = node.clone();
            let message = message.clone();
            let network = self.network.clone();
            tasks.spawn(async move {
                let reply = request(&node, &message, &network).await;
                (node, reply)
            });
        }

        let first = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(Message::Utxos(utxos)))) => return Some(utxos.outputs),
                    Ok((node, Ok(other))) => {
                        debug!(%node, command = other.command(), "unexpected reply to getutxo");
                    }
                    Ok((node, Err(e))) => debug!(%node, "getutxo failed: {e}"),
                    Err(e) => debug!("getutxo task failed: {e}"),
                }
            }
            None
        };

        match tokio::time::timeout(self.reply_timeout, first).await {
            Ok(Some(outputs)) => Ok(outputs),
            Ok(None) | Err(_) => Err(WalletError::NoResponse),
        }
    }

    pub async fn balance(&self, address: &Address) -> Result<u64, WalletError> {
        let pkh = address.pubkey_hash();
        let outputs = self.get_utxos(address).await?;
        Ok(outputs
            .values()
            .flat_map(|outs| outs.values())
            .filter(|out| out.is_bound_to(&pkh))
            .map(|out| out.value)
            .sum())
    }

    /// Build, sign and broadcast a payment. Returns the transaction hash.
    pub async fn transfer(&self, wallet: &Wallet, to: &Address, amount: u64) -> Result<Hash256, WalletError> {
        let utxos = self.get_utxos(&wallet.address()).await?;
        let lock_time = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let tx = build_transfer(wallet, &utxos, to, amount, lock_time)?;
        let txid = tx.hash;

        let message = Message::NewTxn(NewTxnMessage { transaction: tx });
        let delivered = broadcast(self.nodes.clone(), &message, &self.network).await;
        if delivered == 0 {
            return Err(WalletError::Undelivered { command: message.command() });
        }
        info!(%txid, %to, amount, delivered, "transfer broadcast");
        Ok(txid)
    }

    /// Ask the SPV nodes to watch `address`.
    pub async fn monitor_address(&self, address: &Address) -> Result<usize, WalletError> {
        let message = Message::NewAddr(NewAddrMessage { address: *address });
        let delivered = broadcast(self.spv_nodes.clone(), &message, &self.network).await;
        if delivered == 0 {
            return Err(WalletError::Undelivered { command: message.command() });
        }
        Ok(delivered)
    }
}
