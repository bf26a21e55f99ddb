//! SPV node: header chain, address monitoring and Merkle-proof verification.
//!
//! The node keeps only block headers. Full peers push `merkleblock` messages
//! for transactions matching our bloom filter; each is checked against a
//! header we hold before it touches the verified UTXO view of the monitored
//! addresses.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use echain_core::bloom::BloomFilter;
use echain_core::error::{BlockError, EchainError, NetworkError, TransactionError};
use echain_core::pow::Target;
use echain_core::types::{BlockHeader, Hash256, PubkeyHash, Transaction, UnspentOutputs};
use echain_network::protocol::{
    FilterloadMessage, GetUtxoMessage, GetheadersMessage, HeadersMessage, MerkleBlockMessage,
    NewAddrMessage, UtxosMessage,
};
use echain_network::{Message, Peer};

use crate::full::newer_than;
use crate::node::BaseNode;
use crate::storage::HeaderChain;

/// False-positive rate of the filter sent to full peers.
const FILTER_FP_RATE: f64 = 0.001;

/// Addresses we watch and what we have verified about them.
#[derive(Debug)]
pub struct MonitorState {
    monitored: BTreeSet<PubkeyHash>,
    filter: BloomFilter,
    utxos: BTreeMap<Hash256, UnspentOutputs>,
    seen: HashSet<Hash256>,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            monitored: BTreeSet::new(),
            filter: BloomFilter::with_capacity(1, FILTER_FP_RATE),
            utxos: BTreeMap::new(),
            seen: HashSet::new(),
        }
    }
}

impl MonitorState {
    /// Start watching `pkh`. Returns false if it was already watched.
    pub fn watch(&mut self, pkh: PubkeyHash) -> bool {
        if !self.monitored.insert(pkh) {
            return false;
        }
        let mut filter = BloomFilter::with_capacity(self.monitored.len(), FILTER_FP_RATE);
        for watched in &self.monitored {
            filter.insert_pubkey_hash(watched);
        }
        self.filter = filter;
        true
    }

    pub fn is_watching(&self, pkh: &PubkeyHash) -> bool {
        self.monitored.contains(pkh)
    }

    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }

    /// Whether `tx` spends from or pays to a monitored address.
    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        self.monitored.iter().any(|pkh| tx.touches(pkh))
    }

    /// Apply a verified transaction: drop the outputs it spends and keep
    /// the outputs it pays to monitored addresses. Returns false if it was
    /// already applied.
    pub fn apply(&mut self, tx: &Transaction) -> bool {
        if !self.seen.insert(tx.hash) {
            return false;
        }
        for input in &tx.inputs {
            let outpoint = &input.previous_output;
            if let Some(outputs) = self.utxos.get_mut(&outpoint.txid) {
                outputs.remove(&outpoint.index);
                if outputs.is_empty() {
                    self.utxos.remove(&outpoint.txid);
                }
            }
        }
        let owned: UnspentOutputs = tx
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, out)| self.monitored.contains(&out.locking.pubkey_hash))
            .map(|(index, out)| (index as u32, out.clone()))
            .collect();
        if !owned.is_empty() {
            self.utxos.insert(tx.hash, owned);
        }
        true
    }

    /// Verified unspent outputs locked to `pkh`.
    pub fn utxos_for(&self, pkh: &PubkeyHash) -> BTreeMap<Hash256, UnspentOutputs> {
        self.utxos
            .iter()
            .filter_map(|(txid, outputs)| {
                let owned: UnspentOutputs = outputs
                    .iter()
                    .filter(|(_, out)| out.is_bound_to(pkh))
                    .map(|(index, out)| (*index, out.clone()))
                    .collect();
                (!owned.is_empty()).then_some((*txid, owned))
            })
            .collect()
    }
}

/// A header-only node.
pub struct SpvNode {
    base: BaseNode,
    headers: RwLock<HeaderChain>,
    monitor: Mutex<MonitorState>,
    target: Target,
}

impl SpvNode {
    /// Open the header chain, storing the genesis header on first use.
    pub fn open(base: BaseNode) -> Result<Self, EchainError> {
        let config = base.config();
        let genesis = config.genesis()?;
        let headers = HeaderChain::open_with_genesis(config.header_db_path(), &genesis.header)?;
        let target = config.target();
        Ok(Self {
            base,
            headers: RwLock::new(headers),
            monitor: Mutex::new(MonitorState::default()),
            target,
        })
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    pub fn headers(&self) -> &RwLock<HeaderChain> {
        &self.headers
    }

    pub fn monitor(&self) -> &Mutex<MonitorState> {
        &self.monitor
    }

    pub fn best_height(&self) -> Result<u64, EchainError> {
        self.headers.read().height()
    }

    pub fn tip(&self) -> Result<Hash256, EchainError> {
        self.headers.read().tip()
    }

    fn getheaders(&self) -> Result<Message, EchainError> {
        Ok(Message::Getheaders(GetheadersMessage {
            top_hash: self.tip()?,
            addr_from: self.base.address().to_string(),
        }))
    }

    fn filterload(&self) -> Option<Message> {
        let monitor = self.monitor.lock();
        if monitor.monitored.is_empty() {
            return None;
        }
        Some(Message::Filterload(FilterloadMessage {
            addr_from: self.base.address().to_string(),
            filter: monitor.filter.clone(),
        }))
    }

    pub(crate) async fn on_peer_connected(&self, peer: &Peer) -> Result<(), EchainError> {
        let getheaders = self.getheaders()?;
        self.base.send(&peer.address, getheaders).await;
        if peer.role.stores_blocks() {
            if let Some(filterload) = self.filterload() {
                self.base.send(&peer.address, filterload).await;
            }
        }
        Ok(())
    }

    pub async fn handle(&self, message: Message) -> Result<Option<Message>, EchainError> {
        match message {
            Message::Headers(m) => self.handle_headers(m).map(|_| None),
            Message::Getheaders(m) => self.handle_getheaders(m).await.map(|_| None),
            Message::NewAddr(m) => self.handle_newaddr(m).await.map(|_| None),
            Message::MerkleBlock(m) => self.handle_merkleblock(m).await.map(|_| None),
            Message::GetUtxo(m) => Ok(Some(self.handle_getutxo(m))),
            other => {
                debug!(command = other.command(), "ignoring message");
                Ok(None)
            }
        }
    }

    /// Store the prefix of `headers` that links up and meets the target.
    /// Returns how many new headers were stored.
    pub fn store_headers(&self, headers: &[BlockHeader]) -> Result<usize, EchainError> {
        let chain = self.headers.write();
        let mut previous: Option<Hash256> = None;
        let mut last_stored = None;
        let mut stored = 0;

        for header in headers {
            let hash = header.hash();
            let linked = previous == Some(header.prev_hash) || chain.contains(&header.prev_hash)?;
            if !linked {
                debug!(%hash, "header does not link; stopping");
                break;
            }
            if !self.target.is_met_by(&hash) {
                debug!(%hash, "header fails proof of work; stopping");
                break;
            }
            if !chain.contains(&hash)? {
                chain.put(header)?;
                stored += 1;
                last_stored = Some(hash);
            }
            previous = Some(hash);
        }

        if let Some(last) = last_stored {
            chain.set_last_hash(&last)?;
            info!(tip = %last, stored, "header chain extended");
        }
        Ok(stored)
    }

    fn handle_headers(&self, msg: HeadersMessage) -> Result<(), EchainError> {
        self.store_headers(&msg.headers).map(|_| ())
    }

    async fn handle_getheaders(&self, msg: GetheadersMessage) -> Result<(), EchainError> {
        let newer = {
            let chain = self.headers.read();
            newer_than(&*chain, &msg.top_hash, self.base.network().max_headers)?
        };
        match newer {
            Some(headers) if !headers.is_empty() => {
                self.base
                    .send(&msg.addr_from, Message::Headers(HeadersMessage { headers }))
                    .await;
            }
            Some(_) => {}
            None => {
                let getheaders = self.getheaders()?;
                self.base.send(&msg.addr_from, getheaders).await;
            }
        }
        Ok(())
    }

    async fn handle_newaddr(&self, msg: NewAddrMessage) -> Result<(), EchainError> {
        let added = self.monitor.lock().watch(msg.address.pubkey_hash());
        if !added {
            return Ok(());
        }
        info!(address = %msg.address, "monitoring address");
        if let Some(filterload) = self.filterload() {
            self.base.broadcast(self.base.block_peers(), filterload).await;
        }
        Ok(())
    }

    /// Wait for `hash` to reach the header chain, asking block peers for
    /// headers. Returns false if it never arrives.
    async fn await_header(&self, hash: &Hash256, from: &str) -> Result<bool, EchainError> {
        let config = self.base.config();
        tokio::time::sleep(config.header_wait).await;
        if self.headers.read().contains(hash)? {
            return Ok(true);
        }

        let mut ask: Vec<String> = self
            .base
            .block_peers()
            .into_iter()
            .filter(|peer| peer != from)
            .collect();
        if ask.is_empty() {
            ask.push(from.to_string());
        }
        let getheaders = self.getheaders()?;
        self.base.broadcast(ask, getheaders).await;

        for _ in 0..config.header_poll_attempts {
            tokio::time::sleep(config.header_poll_interval).await;
            if self.headers.read().contains(hash)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Check a `merkleblock` against our headers and apply its transaction.
    /// Returns whether the verified view changed.
    async fn handle_merkleblock(&self, msg: MerkleBlockMessage) -> Result<bool, EchainError> {
        let hash = msg.header.hash();
        let known = self.headers.read().contains(&hash)?;
        if !known && !self.await_header(&hash, &msg.addr_from).await? {
            let e = NetworkError::SyncTimeout(hash.to_string());
            debug!(peer = %msg.addr_from, "dropping merkle proof: {e}");
            return Ok(false);
        }
        self.verify_merkle_block(&msg)?;

        let tx = &msg.transaction;
        let mut monitor = self.monitor.lock();
        if !monitor.is_relevant(tx) {
            debug!(txid = %tx.hash, "proof for unmonitored transaction");
            return Ok(false);
        }
        let applied = monitor.apply(tx);
        if applied {
            info!(txid = %tx.hash, block = %hash, "verified transaction");
        }
        Ok(applied)
    }

    /// Proof of work, transaction hash, and inclusion under the header's
    /// Merkle root.
    pub fn verify_merkle_block(&self, msg: &MerkleBlockMessage) -> Result<(), EchainError> {
        if !self.target.is_met_by(&msg.header.hash()) {
            return Err(BlockError::InvalidPoW.into());
        }
        let tx = &msg.transaction;
        let computed = tx.compute_hash()?;
        if computed != tx.hash {
            return Err(TransactionError::HashMismatch {
                stored: tx.hash.to_string(),
                computed: computed.to_string(),
            }
            .into());
        }
        if msg.proof.leaf != tx.merkle_leaf()? || !msg.proof.verify(&msg.header.merkle_root) {
            return Err(BlockError::InvalidMerkleRoot.into());
        }
        Ok(())
    }

    fn handle_getutxo(&self, msg: GetUtxoMessage) -> Message {
        let outputs = self.monitor.lock().utxos_for(&msg.address.pubkey_hash());
        Message::Utxos(UtxosMessage { outputs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use echain_core::address::Address;
    use echain_core::constants::NodeRole;
    use echain_core::crypto::{KeyPair, sign_transaction};
    use echain_core::pow::mine;
    use echain_core::types::{Block, OutPoint, TxInput, TxOutput};

    struct Fixture {
        node: SpvNode,
        owner: KeyPair,
        genesis: Block,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let owner = KeyPair::generate();
        let mut config = NodeConfig::local(NodeRole::Spv, dir.path());
        config.genesis_address = Address::from_pubkey_hash(owner.pubkey_hash());
        config.header_wait = std::time::Duration::from_millis(10);
        config.header_poll_interval = std::time::Duration::from_millis(10);
        config.header_poll_attempts = 3;
        let genesis = config.genesis().unwrap();
        let node = SpvNode::open(BaseNode::new(config, "127.0.0.1:1")).unwrap();
        Fixture {
            node,
            owner,
            genesis,
            _dir: dir,
        }
    }

    fn next_block(f: &Fixture, prev: Hash256, txs: Vec<Transaction>, lock_time: u64) -> Block {
        let mut all = vec![Transaction::coinbase(PubkeyHash([9; 20]), lock_time).unwrap()];
        all.extend(txs);
        let mut block = Block::new(prev, all, 7_000 + lock_time).unwrap();
        mine(&mut block, &f.node.target);
        block
    }

    fn payment(f: &Fixture, to: PubkeyHash) -> Transaction {
        let outpoint = OutPoint::new(f.genesis.transactions[0].hash, 0);
        let mut tx = Transaction::new(
            vec![TxInput::new(outpoint, f.owner.public_key().to_bytes())],
            vec![TxOutput::new(1000, to)],
            3,
        );
        sign_transaction(&mut tx, &f.owner).unwrap();
        tx.set_hash().unwrap();
        tx
    }

    fn merkle_block(block: &Block, tx: &Transaction) -> MerkleBlockMessage {
        MerkleBlockMessage {
            header: block.header.clone(),
            proof: block.merkle_proof(&tx.hash).unwrap().unwrap(),
            transaction: tx.clone(),
            addr_from: "127.0.0.1:9".into(),
        }
    }

    async fn watch(f: &Fixture, pkh: PubkeyHash) {
        f.node
            .handle(Message::NewAddr(NewAddrMessage {
                address: Address::from_pubkey_hash(pkh),
            }))
            .await
            .unwrap();
    }

    #[test]
    fn headers_store_linked_prefix() {
        let f = fixture();
        let b1 = next_block(&f, f.genesis.hash(), vec![], 2);
        let b2 = next_block(&f, b1.hash(), vec![], 3);
        let stray = next_block(&f, Hash256([6; 32]), vec![], 4);

        let stored = f
            .node
            .store_headers(&[b1.header.clone(), b2.header.clone(), stray.header.clone()])
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(f.node.tip().unwrap(), b2.hash());
        assert_eq!(f.node.best_height().unwrap(), 3);

        // Replaying known headers stores nothing and keeps the tip.
        assert_eq!(f.node.store_headers(&[b1.header.clone()]).unwrap(), 0);
        assert_eq!(f.node.tip().unwrap(), b2.hash());
    }

    #[test]
    fn headers_failing_pow_are_dropped() {
        let f = fixture();
        let mut b1 = next_block(&f, f.genesis.hash(), vec![], 2);
        // Find a nonce whose hash misses the target.
        while f.node.target.is_met_by(&b1.hash()) {
            b1.header.nonce += 1;
        }
        assert_eq!(f.node.store_headers(&[b1.header]).unwrap(), 0);
        assert_eq!(f.node.tip().unwrap(), f.genesis.hash());
    }

    #[tokio::test]
    async fn newaddr_builds_filter() {
        let f = fixture();
        let pkh = PubkeyHash([2; 20]);
        watch(&f, pkh).await;
        let monitor = f.node.monitor().lock();
        assert!(monitor.is_watching(&pkh));
        assert!(monitor.filter().contains(pkh.as_bytes()));
    }

    #[tokio::test]
    async fn verified_merkleblock_updates_view() {
        let f = fixture();
        let watched = PubkeyHash([2; 20]);
        watch(&f, watched).await;

        let tx = payment(&f, watched);
        let block = next_block(&f, f.genesis.hash(), vec![tx.clone()], 2);
        f.node.store_headers(&[block.header.clone()]).unwrap();

        let changed = f.node.handle_merkleblock(merkle_block(&block, &tx)).await.unwrap();
        assert!(changed);

        let reply = f
            .node
            .handle(Message::GetUtxo(GetUtxoMessage {
                address: Address::from_pubkey_hash(watched),
            }))
            .await
            .unwrap();
        let Some(Message::Utxos(utxos)) = reply else {
            panic!("expected utxos");
        };
        assert_eq!(utxos.outputs[&tx.hash][&0].value, 1000);

        // Applying the same proof again changes nothing.
        assert!(!f.node.handle_merkleblock(merkle_block(&block, &tx)).await.unwrap());
    }

    #[tokio::test]
    async fn tampered_proof_is_rejected() {
        let f = fixture();
        let watched = PubkeyHash([2; 20]);
        watch(&f, watched).await;
        let tx = payment(&f, watched);
        let block = next_block(&f, f.genesis.hash(), vec![tx.clone()], 2);
        f.node.store_headers(&[block.header.clone()]).unwrap();

        let mut msg = merkle_block(&block, &tx);
        msg.proof.path[0].hash = Hash256([0xEE; 32]);
        let err = f.node.handle_merkleblock(msg).await.unwrap_err();
        assert!(matches!(err, EchainError::Block(BlockError::InvalidMerkleRoot)));
        assert!(f.node.monitor().lock().utxos_for(&watched).is_empty());
    }

    #[tokio::test]
    async fn proof_for_unknown_header_times_out() {
        let f = fixture();
        let watched = PubkeyHash([2; 20]);
        watch(&f, watched).await;
        let tx = payment(&f, watched);
        let block = next_block(&f, f.genesis.hash(), vec![tx.clone()], 2);

        let changed = f.node.handle_merkleblock(merkle_block(&block, &tx)).await.unwrap();
        assert!(!changed);
        assert!(f.node.monitor().lock().utxos_for(&watched).is_empty());
    }

    #[test]
    fn spend_removes_verified_output() {
        let mut monitor = MonitorState::default();
        let pkh = PubkeyHash([2; 20]);
        monitor.watch(pkh);

        let receive = {
            let mut tx = Transaction::new(vec![], vec![TxOutput::new(50, pkh)], 1);
            tx.set_hash().unwrap();
            tx
        };
        assert!(monitor.apply(&receive));
        assert_eq!(monitor.utxos_for(&pkh).len(), 1);

        let spend = {
            let input = TxInput::new(OutPoint::new(receive.hash, 0), vec![4; 65]);
            let mut tx = Transaction::new(vec![input], vec![TxOutput::new(50, PubkeyHash([3; 20]))], 2);
            tx.set_hash().unwrap();
            tx
        };
        assert!(monitor.apply(&spend));
        assert!(monitor.utxos_for(&pkh).is_empty());
    }
}
