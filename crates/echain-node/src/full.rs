//! Full node: block storage, UTXO index, mempool and relay.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use echain_core::bloom::BloomFilter;
use echain_core::error::{BlockError, EchainError, NetworkError};
use echain_core::mempool::Mempool;
use echain_core::pow::Target;
use echain_core::types::{Block, BlockHeader, Hash256, Transaction};
use echain_core::validation::{check_block, validate_block_transactions, validate_transaction};
use echain_network::protocol::{
    BlockOrigin, BlockdataMessage, FilterloadMessage, GetblocksMessage, GetdataMessage,
    GetheadersMessage, GetUtxoMessage, HeadersMessage, InvMessage, MerkleBlockMessage,
    NewTxnMessage, UtxosMessage,
};
use echain_network::{Message, Peer};

use crate::node::BaseNode;
use crate::storage::{BlockChain, ChainRecord, ChainStore};

/// Records newer than `top_hash`, oldest first and capped at `limit`, or
/// `None` if `top_hash` is not on our chain.
pub(crate) fn newer_than<R: ChainRecord>(
    store: &ChainStore<R>,
    top_hash: &Hash256,
    limit: usize,
) -> Result<Option<Vec<R>>, EchainError> {
    let (found, newer) = store.unmatched(top_hash)?;
    if !found {
        return Ok(None);
    }
    Ok(Some(newer.into_iter().rev().take(limit).collect()))
}

/// What became of a `blockdata(Mined)` block that failed to connect.
enum Rejection {
    Invalid(EchainError),
    /// The parent is unknown; ask the sender for what we lack.
    Orphan(EchainError),
}

/// A node holding full blocks.
pub struct FullNode {
    base: BaseNode,
    chain: Arc<RwLock<BlockChain>>,
    mempool: Mutex<Mempool>,
    /// Bloom filters loaded by SPV peers, keyed by their address.
    filters: Mutex<HashMap<String, BloomFilter>>,
    /// Held for the duration of a catch-up round.
    pub(crate) sync_round: tokio::sync::Mutex<()>,
    target: Target,
}

impl FullNode {
    /// Open the block chain, storing genesis on first use.
    pub fn open(base: BaseNode) -> Result<Self, EchainError> {
        let config = base.config();
        let genesis = config.genesis()?;
        let chain = BlockChain::open_with_genesis(config.db_path(), &genesis)?;
        let target = config.target();
        Ok(Self {
            base,
            chain: Arc::new(RwLock::new(chain)),
            mempool: Mutex::new(Mempool::with_defaults()),
            filters: Mutex::new(HashMap::new()),
            sync_round: tokio::sync::Mutex::new(()),
            target,
        })
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    pub fn chain(&self) -> &Arc<RwLock<BlockChain>> {
        &self.chain
    }

    pub fn mempool(&self) -> &Mutex<Mempool> {
        &self.mempool
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn best_height(&self) -> Result<u64, EchainError> {
        self.chain.read().height()
    }

    pub fn tip(&self) -> Result<Hash256, EchainError> {
        self.chain.read().tip()
    }

    fn getblocks(&self) -> Result<Message, EchainError> {
        let (top_hash, best_height) = {
            let chain = self.chain.read();
            (chain.tip()?, chain.height()?)
        };
        Ok(Message::Getblocks(GetblocksMessage {
            top_hash,
            best_height,
            addr_from: self.base.address().to_string(),
        }))
    }

    pub(crate) async fn on_peer_connected(&self, peer: &Peer) -> Result<(), EchainError> {
        if peer.role.stores_blocks() {
            let getblocks = self.getblocks()?;
            self.base.send(&peer.address, getblocks).await;
        }
        Ok(())
    }

    /// Ask every block-storing peer what we are missing.
    pub(crate) async fn request_blocks_from_peers(&self) -> Result<(), EchainError> {
        let getblocks = self.getblocks()?;
        self.base.broadcast(self.base.block_peers(), getblocks).await;
        Ok(())
    }

    /// Dispatch a message outside the handshake.
    pub async fn handle(&self, message: Message) -> Result<Option<Message>, EchainError> {
        match message {
            Message::Getblocks(m) => self.handle_getblocks(m).await.map(|_| None),
            Message::Getheaders(m) => self.handle_getheaders(m).await.map(|_| None),
            Message::Getdata(m) => self.handle_getdata(m).map(Some),
            Message::Inv(m) => self.handle_inv(m).await.map(|_| None),
            Message::Blockdata(m) => self.handle_blockdata(m).await.map(|_| None),
            Message::NewTxn(m) => self.handle_newtxn(m).await.map(|_| None),
            Message::Filterload(m) => self.handle_filterload(m).map(|_| None),
            Message::GetUtxo(m) => self.handle_getutxo(m).map(Some),
            other => {
                debug!(command = other.command(), "ignoring message");
                Ok(None)
            }
        }
    }

    async fn handle_getblocks(&self, msg: GetblocksMessage) -> Result<(), EchainError> {
        let (newer, our_height) = {
            let chain = self.chain.read();
            let newer = newer_than(&*chain, &msg.top_hash, self.base.network().max_inv_hashes)?;
            (newer, chain.height()?)
        };

        match newer {
            Some(blocks) if !blocks.is_empty() => {
                let inv = InvMessage {
                    hashes: blocks.iter().map(Block::hash).collect(),
                    addr_from: self.base.address().to_string(),
                };
                debug!(peer = %msg.addr_from, count = inv.hashes.len(), "advertising blocks");
                self.base.send(&msg.addr_from, Message::Inv(inv)).await;
            }
            Some(_) => {}
            None if msg.best_height > our_height => {
                let getblocks = self.getblocks()?;
                self.base.send(&msg.addr_from, getblocks).await;
            }
            None => debug!(peer = %msg.addr_from, "peer tip unknown and not longer; ignoring"),
        }
        Ok(())
    }

    async fn handle_getheaders(&self, msg: GetheadersMessage) -> Result<(), EchainError> {
        let newer = {
            let chain = self.chain.read();
            newer_than(&*chain, &msg.top_hash, self.base.network().max_headers)?
        };
        if let Some(blocks) = newer.filter(|b| !b.is_empty()) {
            let headers: Vec<BlockHeader> = blocks.into_iter().map(|b| b.header).collect();
            debug!(peer = %msg.addr_from, count = headers.len(), "sending headers");
            self.base
                .send(&msg.addr_from, Message::Headers(HeadersMessage { headers }))
                .await;
        }
        Ok(())
    }

    fn handle_getdata(&self, msg: GetdataMessage) -> Result<Message, EchainError> {
        let blocks = self.chain.read().records_from_hashes(&msg.hashes)?;
        debug!(peer = %msg.addr_from, batch = msg.batch, count = blocks.len(), "serving blocks");
        // The requester alone knows the round size; mark this reply as the
        // last batch it asked us for.
        Ok(Message::Blockdata(BlockdataMessage {
            origin: BlockOrigin::Batch {
                index: msg.batch,
                total: msg.batch + 1,
            },
            blocks,
            addr_from: self.base.address().to_string(),
        }))
    }

    async fn handle_blockdata(&self, msg: BlockdataMessage) -> Result<(), EchainError> {
        match msg.origin {
            BlockOrigin::Mined => {
                for block in msg.blocks {
                    self.accept_mined_block(block, &msg.addr_from).await?;
                }
                Ok(())
            }
            BlockOrigin::Batch { index, total } => {
                let last = msg.blocks.last().map(Block::hash);
                {
                    let chain = self.chain.read();
                    for block in &msg.blocks {
                        chain.put(block)?;
                    }
                }
                if let Some(last) = last.filter(|_| index + 1 == total) {
                    self.adopt_tip(last)?;
                }
                Ok(())
            }
        }
    }

    /// Move the tip to `hash` if it links to genesis, rebuilding the index.
    pub(crate) fn adopt_tip(&self, hash: Hash256) -> Result<bool, EchainError> {
        let chain = self.chain.write();
        if chain.last_hash()? == Some(hash) || !chain.is_connected(&hash)? {
            return Ok(false);
        }
        chain.reindex(Some(hash))?;
        info!(tip = %hash, height = chain.height()?, "adopted synced tip");
        Ok(true)
    }

    async fn accept_mined_block(&self, block: Block, from: &str) -> Result<(), EchainError> {
        match self.accept_block(&block) {
            Ok(()) => {
                self.announce_block(&block, Some(from)).await?;
                Ok(())
            }
            Err(Rejection::Orphan(e)) => {
                let getblocks = self.getblocks()?;
                self.base.send(from, getblocks).await;
                Err(e)
            }
            Err(Rejection::Invalid(e)) => Err(e),
        }
    }

    /// Validate `block` against our tip and commit it with its UTXO update.
    fn accept_block(&self, block: &Block) -> Result<(), Rejection> {
        check_block(block, &self.target).map_err(|e| Rejection::Invalid(e.into()))?;
        let hash = block.hash();
        {
            let chain = self.chain.write();
            if chain.contains(&hash).map_err(Rejection::Invalid)? {
                return Err(Rejection::Invalid(BlockError::DuplicateBlock(hash.to_string()).into()));
            }
            let tip = chain.tip().map_err(Rejection::Invalid)?;
            if block.header.prev_hash != tip {
                let error = BlockError::PrevHashMismatch {
                    expected: tip.to_string(),
                    got: block.header.prev_hash.to_string(),
                }
                .into();
                return match chain.contains(&block.header.prev_hash) {
                    Ok(false) => Err(Rejection::Orphan(error)),
                    Ok(true) => Err(Rejection::Invalid(error)),
                    Err(e) => Err(Rejection::Invalid(e)),
                };
            }
            validate_block_transactions(block, &*chain).map_err(Rejection::Invalid)?;
            chain.store(block).map_err(Rejection::Invalid)?;
        }
        self.mempool.lock().remove_confirmed_block(block);
        info!(%hash, txs = block.transactions.len(), "accepted block");
        Ok(())
    }

    /// Relay a newly connected block to block peers and send proofs of
    /// matching transactions to SPV peers.
    pub(crate) async fn announce_block(&self, block: &Block, skip: Option<&str>) -> Result<(), EchainError> {
        let (relay_to, spv_peers) = {
            let peers = self.base.peers().lock();
            let relay_to: Vec<String> = peers
                .block_peers()
                .into_iter()
                .filter(|addr| Some(addr.as_str()) != skip)
                .collect();
            (relay_to, peers.spv_peers())
        };

        let relay = Message::Blockdata(BlockdataMessage {
            origin: BlockOrigin::Mined,
            blocks: vec![block.clone()],
            addr_from: self.base.address().to_string(),
        });
        self.base.broadcast(relay_to, relay).await;

        for (peer, proofs) in self.merkle_blocks_for(block, &spv_peers)? {
            for merkle_block in proofs {
                self.base.send(&peer, Message::MerkleBlock(merkle_block)).await;
            }
        }
        Ok(())
    }

    /// `merkleblock` messages for every SPV peer whose filter matches a
    /// transaction of `block`.
    fn merkle_blocks_for(
        &self,
        block: &Block,
        spv_peers: &[String],
    ) -> Result<Vec<(String, Vec<MerkleBlockMessage>)>, EchainError> {
        let filters = self.filters.lock();
        let mut out = Vec::new();
        for peer in spv_peers {
            let Some(filter) = filters.get(peer) else {
                continue;
            };
            let mut messages = Vec::new();
            for tx in block.transactions.iter().filter(|tx| filter.matches_transaction(tx)) {
                let Some(proof) = block.merkle_proof(&tx.hash)? else {
                    continue;
                };
                messages.push(MerkleBlockMessage {
                    header: block.header.clone(),
                    proof,
                    transaction: tx.clone(),
                    addr_from: self.base.address().to_string(),
                });
            }
            if !messages.is_empty() {
                out.push((peer.clone(), messages));
            }
        }
        Ok(out)
    }

    async fn handle_newtxn(&self, msg: NewTxnMessage) -> Result<(), EchainError> {
        let tx = msg.transaction;
        if self.mempool.lock().contains(&tx.hash) {
            return Ok(());
        }
        let txid = self.admit_transaction(tx.clone())?;
        debug!(%txid, "added transaction to mempool");

        let relay = Message::NewTxn(NewTxnMessage { transaction: tx });
        self.base.broadcast(self.base.block_peers(), relay).await;
        Ok(())
    }

    /// Validate against the UTXO index and insert into the mempool.
    pub fn admit_transaction(&self, tx: Transaction) -> Result<Hash256, EchainError> {
        let fee = {
            let chain = self.chain.read();
            validate_transaction(&tx, &*chain)?
        };
        Ok(self.mempool.lock().insert(tx, fee)?)
    }

    fn handle_filterload(&self, msg: FilterloadMessage) -> Result<(), EchainError> {
        if !msg.filter.is_consistent() {
            return Err(NetworkError::Malformed {
                command: "filterload".into(),
                reason: "inconsistent bloom filter".into(),
            }
            .into());
        }
        debug!(peer = %msg.addr_from, bits = msg.filter.num_bits(), "loaded filter");
        self.filters.lock().insert(msg.addr_from, msg.filter);
        Ok(())
    }

    /// Whether `peer` has loaded a bloom filter with us.
    pub fn has_filter(&self, peer: &str) -> bool {
        self.filters.lock().contains_key(peer)
    }

    fn handle_getutxo(&self, msg: GetUtxoMessage) -> Result<Message, EchainError> {
        let outputs = self.chain.read().find_utxos(&msg.address.pubkey_hash())?;
        Ok(Message::Utxos(UtxosMessage { outputs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use echain_core::address::Address;
    use echain_core::constants::{COINBASE_REWARD, NodeRole};
    use echain_core::crypto::{KeyPair, sign_transaction};
    use echain_core::error::{MempoolError, TransactionError};
    use echain_core::pow::mine;
    use echain_core::types::{OutPoint, PubkeyHash, TxInput, TxOutput};

    struct Fixture {
        node: FullNode,
        owner: KeyPair,
        genesis: Block,
        _dir: tempfile::TempDir,
    }

    /// A full node whose genesis pays `owner`.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let owner = KeyPair::generate();
        let mut config = NodeConfig::local(NodeRole::Full, dir.path());
        config.genesis_address = Address::from_pubkey_hash(owner.pubkey_hash());
        let genesis = config.genesis().unwrap();
        let node = FullNode::open(BaseNode::new(config, "127.0.0.1:1")).unwrap();
        Fixture {
            node,
            owner,
            genesis,
            _dir: dir,
        }
    }

    fn spend(from: &KeyPair, outpoint: OutPoint, outputs: Vec<TxOutput>) -> Transaction {
        let input = TxInput::new(outpoint, from.public_key().to_bytes());
        let mut tx = Transaction::new(vec![input], outputs, 0);
        sign_transaction(&mut tx, from).unwrap();
        tx.set_hash().unwrap();
        tx
    }

    fn mined_on(node: &FullNode, prev: Hash256, txs: Vec<Transaction>, lock_time: u64) -> Block {
        let mut all = vec![Transaction::coinbase(PubkeyHash([9; 20]), lock_time).unwrap()];
        all.extend(txs);
        let mut block = Block::new(prev, all, 5_000 + lock_time).unwrap();
        mine(&mut block, node.target());
        block
    }

    fn mined_msg(block: Block) -> Message {
        Message::Blockdata(BlockdataMessage {
            origin: BlockOrigin::Mined,
            blocks: vec![block],
            addr_from: "127.0.0.1:9".into(),
        })
    }

    #[tokio::test]
    async fn getutxo_reports_genesis_output() {
        let f = fixture();
        let reply = f
            .node
            .handle(Message::GetUtxo(GetUtxoMessage {
                address: Address::from_pubkey_hash(f.owner.pubkey_hash()),
            }))
            .await
            .unwrap();
        let Some(Message::Utxos(utxos)) = reply else {
            panic!("expected utxos reply, got {reply:?}");
        };
        let genesis_tx = f.genesis.transactions[0].hash;
        assert_eq!(utxos.outputs.len(), 1);
        assert_eq!(utxos.outputs[&genesis_tx][&0].value, COINBASE_REWARD);
    }

    #[tokio::test]
    async fn getdata_replies_with_known_blocks() {
        let f = fixture();
        let reply = f
            .node
            .handle(Message::Getdata(GetdataMessage {
                batch: 2,
                hashes: vec![f.genesis.hash(), Hash256([3; 32])],
                addr_from: "127.0.0.1:9".into(),
            }))
            .await
            .unwrap();
        let Some(Message::Blockdata(data)) = reply else {
            panic!("expected blockdata reply");
        };
        assert_eq!(data.blocks, vec![f.genesis.clone()]);
        assert_eq!(data.origin, BlockOrigin::Batch { index: 2, total: 3 });
    }

    #[tokio::test]
    async fn newtxn_enters_mempool_once() {
        let f = fixture();
        let tx = spend(
            &f.owner,
            OutPoint::new(f.genesis.transactions[0].hash, 0),
            vec![TxOutput::new(600, PubkeyHash([1; 20])), TxOutput::new(390, f.owner.pubkey_hash())],
        );
        let msg = Message::NewTxn(NewTxnMessage { transaction: tx.clone() });
        f.node.handle(msg.clone()).await.unwrap();
        f.node.handle(msg).await.unwrap();

        let pool = f.node.mempool().lock();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&tx.hash).unwrap().fee, 10);
    }

    #[tokio::test]
    async fn newtxn_rejects_unknown_outpoint() {
        let f = fixture();
        let tx = spend(
            &f.owner,
            OutPoint::new(Hash256([4; 32]), 0),
            vec![TxOutput::new(1, f.owner.pubkey_hash())],
        );
        let err = f
            .node
            .handle(Message::NewTxn(NewTxnMessage { transaction: tx }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EchainError::Transaction(TransactionError::DanglingReference(_))
        ));
        assert!(f.node.mempool().lock().is_empty());
    }

    #[test]
    fn conflicting_pool_transaction_is_rejected() {
        let f = fixture();
        let outpoint = OutPoint::new(f.genesis.transactions[0].hash, 0);
        let first = spend(&f.owner, outpoint, vec![TxOutput::new(500, PubkeyHash([1; 20]))]);
        let second = spend(&f.owner, outpoint, vec![TxOutput::new(400, PubkeyHash([2; 20]))]);
        f.node.admit_transaction(first).unwrap();
        assert!(matches!(
            f.node.admit_transaction(second),
            Err(EchainError::Mempool(MempoolError::Conflict { .. }))
        ));
    }

    #[tokio::test]
    async fn mined_block_is_accepted_and_clears_mempool() {
        let f = fixture();
        let tx = spend(
            &f.owner,
            OutPoint::new(f.genesis.transactions[0].hash, 0),
            vec![TxOutput::new(1000, PubkeyHash([1; 20]))],
        );
        f.node.admit_transaction(tx.clone()).unwrap();

        let block = mined_on(&f.node, f.genesis.hash(), vec![tx], 2);
        f.node.handle(mined_msg(block.clone())).await.unwrap();

        assert_eq!(f.node.tip().unwrap(), block.hash());
        assert_eq!(f.node.best_height().unwrap(), 2);
        assert!(f.node.mempool().lock().is_empty());
        let chain = f.node.chain().read();
        assert_eq!(chain.balance(&f.owner.pubkey_hash()).unwrap(), 0);
        assert_eq!(chain.balance(&PubkeyHash([1; 20])).unwrap(), 1000);
    }

    #[tokio::test]
    async fn duplicate_block_is_rejected() {
        let f = fixture();
        let block = mined_on(&f.node, f.genesis.hash(), vec![], 2);
        f.node.handle(mined_msg(block.clone())).await.unwrap();
        let err = f.node.handle(mined_msg(block)).await.unwrap_err();
        assert!(matches!(err, EchainError::Block(BlockError::DuplicateBlock(_))));
    }

    #[tokio::test]
    async fn block_not_on_tip_is_rejected() {
        let f = fixture();
        let orphan = mined_on(&f.node, Hash256([8; 32]), vec![], 2);
        let err = f.node.handle(mined_msg(orphan)).await.unwrap_err();
        assert!(matches!(err, EchainError::Block(BlockError::PrevHashMismatch { .. })));
        assert_eq!(f.node.tip().unwrap(), f.genesis.hash());
    }

    #[tokio::test]
    async fn block_with_bad_signature_is_rejected() {
        let f = fixture();
        let thief = KeyPair::generate();
        let tx = spend(
            &thief,
            OutPoint::new(f.genesis.transactions[0].hash, 0),
            vec![TxOutput::new(1000, thief.pubkey_hash())],
        );
        let block = mined_on(&f.node, f.genesis.hash(), vec![tx], 2);
        let err = f.node.handle(mined_msg(block)).await.unwrap_err();
        assert!(matches!(
            err,
            EchainError::Block(BlockError::Transaction {
                index: 1,
                source: TransactionError::InvalidKey { index: 0 }
            })
        ));
        assert_eq!(f.node.best_height().unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_blockdata_adopts_connected_tip() {
        let f = fixture();
        let b1 = mined_on(&f.node, f.genesis.hash(), vec![], 2);
        let b2 = mined_on(&f.node, b1.hash(), vec![], 3);
        let msg = Message::Blockdata(BlockdataMessage {
            origin: BlockOrigin::Batch { index: 0, total: 1 },
            blocks: vec![b1, b2.clone()],
            addr_from: "127.0.0.1:9".into(),
        });
        f.node.handle(msg).await.unwrap();
        assert_eq!(f.node.tip().unwrap(), b2.hash());
        assert_eq!(f.node.chain().read().balance(&PubkeyHash([9; 20])).unwrap(), 2 * COINBASE_REWARD);
    }

    #[tokio::test]
    async fn filterload_drives_merkle_blocks() {
        let f = fixture();
        let watched = PubkeyHash([1; 20]);
        let mut filter = BloomFilter::with_capacity(4, 0.0001);
        filter.insert_pubkey_hash(&watched);
        f.node
            .handle(Message::Filterload(FilterloadMessage {
                addr_from: "127.0.0.1:7".into(),
                filter,
            }))
            .await
            .unwrap();

        let tx = spend(
            &f.owner,
            OutPoint::new(f.genesis.transactions[0].hash, 0),
            vec![TxOutput::new(1000, watched)],
        );
        let block = mined_on(&f.node, f.genesis.hash(), vec![tx.clone()], 2);
        let proofs = f
            .node
            .merkle_blocks_for(&block, &["127.0.0.1:7".to_string(), "127.0.0.1:8".to_string()])
            .unwrap();
        assert_eq!(proofs.len(), 1);
        let (peer, messages) = &proofs[0];
        assert_eq!(peer, "127.0.0.1:7");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].transaction, tx);
        assert!(messages[0].proof.verify(&block.header.merkle_root));
    }

    #[test]
    fn newer_than_is_oldest_first_and_capped() {
        let f = fixture();
        let b1 = mined_on(&f.node, f.genesis.hash(), vec![], 2);
        let b2 = mined_on(&f.node, b1.hash(), vec![], 3);
        let b3 = mined_on(&f.node, b2.hash(), vec![], 4);
        {
            let chain = f.node.chain().read();
            for block in [&b1, &b2, &b3] {
                chain.store(block).unwrap();
            }
        }
        let chain = f.node.chain().read();
        let all = newer_than(&*chain, &f.genesis.hash(), 10).unwrap().unwrap();
        assert_eq!(all, vec![b1.clone(), b2.clone(), b3]);
        let capped = newer_than(&*chain, &f.genesis.hash(), 2).unwrap().unwrap();
        assert_eq!(capped, vec![b1, b2]);
        assert!(newer_than(&*chain, &Hash256([5; 32]), 10).unwrap().is_none());
    }
}
