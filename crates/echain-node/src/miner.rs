//! Miner node: a full node that assembles and mines blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use echain_core::error::EchainError;
use echain_core::pow::mine_cancellable;
use echain_core::types::{Block, Hash256, PubkeyHash, Transaction};
use echain_core::validation::{BlockView, validate_transaction};

use crate::full::FullNode;
use crate::node::{BaseNode, Node};

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A full node that also mines, paying rewards to a fixed pubkey hash.
pub struct MinerNode {
    full: FullNode,
    reward: PubkeyHash,
    cancel: Arc<AtomicBool>,
}

impl MinerNode {
    pub fn open(base: BaseNode) -> Result<Self, EchainError> {
        let reward = base
            .config()
            .reward_address
            .ok_or_else(|| EchainError::Config("miner requires a reward address".into()))?
            .pubkey_hash();
        Ok(Self {
            full: FullNode::open(base)?,
            reward,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn full(&self) -> &FullNode {
        &self.full
    }

    pub fn reward(&self) -> PubkeyHash {
        self.reward
    }

    /// Stop any in-flight search and the mining loop.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Build a block on the current tip from the pool transactions that
    /// still validate. Pool transactions that no longer validate are evicted.
    fn assemble(&self) -> Result<(Hash256, Block), EchainError> {
        let (tip, height, selected, stale) = {
            let chain = self.full.chain().read();
            let tip = chain.tip()?;
            let height = chain.height()?;
            let pending = self.full.mempool().lock().transactions();

            let mut view = BlockView::new(&*chain);
            let mut selected = Vec::new();
            let mut stale = Vec::new();
            for tx in pending {
                match validate_transaction(&tx, &view) {
                    Ok(_) => {
                        view.apply(&tx);
                        selected.push(tx);
                    }
                    Err(e) => {
                        debug!(txid = %tx.hash, "evicting transaction: {e}");
                        stale.push(tx.hash);
                    }
                }
            }
            (tip, height, selected, stale)
        };

        if !stale.is_empty() {
            let mut pool = self.full.mempool().lock();
            for txid in &stale {
                pool.remove(txid);
            }
        }

        let mut transactions = vec![Transaction::coinbase(self.reward, height + 1)?];
        transactions.extend(selected);
        let block = Block::new(tip, transactions, now_ms())?;
        Ok((tip, block))
    }

    /// One mining attempt. Returns the block if it was mined and became our
    /// tip; `None` if cancelled or if the tip moved meanwhile.
    pub async fn mine_once(&self) -> Result<Option<Block>, EchainError> {
        let (parent, mut block) = self.assemble()?;
        let target = *self.full.target();
        let cancel = Arc::clone(&self.cancel);

        let mined = tokio::task::spawn_blocking(move || {
            mine_cancellable(&mut block, &target, &cancel).map(|_| block)
        })
        .await
        .map_err(|e| EchainError::Task(e.to_string()))?;

        let Some(block) = mined else {
            debug!("mining cancelled");
            return Ok(None);
        };

        {
            let chain = self.full.chain().write();
            if chain.tip()? != parent {
                info!(hash = %block.hash(), "discarding stale block");
                return Ok(None);
            }
            chain.store(&block)?;
        }
        self.full.mempool().lock().remove_confirmed_block(&block);
        info!(
            hash = %block.hash(),
            nonce = block.header.nonce,
            txs = block.transactions.len(),
            "mined block"
        );

        self.full.announce_block(&block, None).await?;
        Ok(Some(block))
    }
}

/// Mine until the node shuts down: wait `mining_delay`, then attempt a block
/// every `mining_interval`.
pub async fn mining_loop(node: Arc<Node>) {
    let Some(miner) = node.miner() else {
        return;
    };
    let config = node.base().config();
    let mut shutdown = node.base().subscribe_shutdown();

    tokio::select! {
        _ = tokio::time::sleep(config.mining_delay) => {}
        _ = shutdown.changed() => return,
    }
    info!(reward = %miner.reward(), "mining started");

    while !miner.is_cancelled() {
        match miner.mine_once().await {
            Ok(Some(_)) | Ok(None) => {}
            Err(e) => warn!("mining attempt failed: {e}"),
        }
        tokio::select! {
            _ = tokio::time::sleep(config.mining_interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("mining stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use echain_core::address::Address;
    use echain_core::constants::{COINBASE_REWARD, NodeRole};
    use echain_core::crypto::{KeyPair, sign_transaction};
    use echain_core::types::{OutPoint, TxInput, TxOutput};

    fn miner(owner: &KeyPair) -> (MinerNode, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::local(NodeRole::Miner, dir.path());
        config.genesis_address = Address::from_pubkey_hash(owner.pubkey_hash());
        config.reward_address = Some(Address::from_pubkey_hash(PubkeyHash([7; 20])));
        let node = MinerNode::open(BaseNode::new(config, "127.0.0.1:1")).unwrap();
        (node, dir)
    }

    fn pay(owner: &KeyPair, outpoint: OutPoint, to: PubkeyHash, value: u64) -> Transaction {
        let mut tx = Transaction::new(
            vec![TxInput::new(outpoint, owner.public_key().to_bytes())],
            vec![TxOutput::new(value, to)],
            1,
        );
        sign_transaction(&mut tx, owner).unwrap();
        tx.set_hash().unwrap();
        tx
    }

    #[tokio::test]
    async fn mine_once_extends_tip_and_pays_reward() {
        let owner = KeyPair::generate();
        let (miner, _dir) = miner(&owner);
        let genesis = miner.full().tip().unwrap();

        let block = miner.mine_once().await.unwrap().unwrap();
        assert_eq!(block.header.prev_hash, genesis);
        assert_eq!(miner.full().tip().unwrap(), block.hash());
        assert!(miner.full().target().is_met_by(&block.hash()));
        assert_eq!(block.transactions[0].lock_time, 2);
        assert_eq!(
            miner.full().chain().read().balance(&PubkeyHash([7; 20])).unwrap(),
            COINBASE_REWARD
        );
    }

    #[tokio::test]
    async fn mine_once_includes_pool_transactions() {
        let owner = KeyPair::generate();
        let (miner, _dir) = miner(&owner);
        let genesis = miner.full().chain().read().tip_record().unwrap();
        let tx = pay(&owner, OutPoint::new(genesis.transactions[0].hash, 0), PubkeyHash([3; 20]), 1000);
        miner.full().admit_transaction(tx.clone()).unwrap();

        let block = miner.mine_once().await.unwrap().unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[1], tx);
        assert!(miner.full().mempool().lock().is_empty());
    }

    #[tokio::test]
    async fn stale_pool_transactions_are_evicted() {
        let owner = KeyPair::generate();
        let (miner, _dir) = miner(&owner);
        let genesis = miner.full().chain().read().tip_record().unwrap();
        let tx = pay(&owner, OutPoint::new(genesis.transactions[0].hash, 0), PubkeyHash([3; 20]), 1000);
        miner.full().admit_transaction(tx).unwrap();

        // Spend the same output in a block that reaches the chain first.
        let rival = pay(&owner, OutPoint::new(genesis.transactions[0].hash, 0), PubkeyHash([4; 20]), 900);
        let coinbase = Transaction::coinbase(PubkeyHash([5; 20]), 2).unwrap();
        let mut block = Block::new(genesis.hash(), vec![coinbase, rival], 10).unwrap();
        echain_core::pow::mine(&mut block, miner.full().target());
        miner.full().chain().read().store(&block).unwrap();

        let mined = miner.mine_once().await.unwrap().unwrap();
        assert_eq!(mined.transactions.len(), 1);
        assert!(miner.full().mempool().lock().is_empty());
    }

    #[test]
    fn cancel_is_sticky() {
        let owner = KeyPair::generate();
        let (miner, _dir) = miner(&owner);
        assert!(!miner.is_cancelled());
        miner.cancel();
        miner.cancel();
        assert!(miner.is_cancelled());
    }
}
