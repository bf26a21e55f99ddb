//! RocksDB-backed chain storage.
//!
//! A [`ChainStore`] is a content-addressed map `hash -> record` plus one
//! mutable tip pointer. Traversal walks `prev_hash` links backwards from a
//! starting hash to genesis; there is no forward index. The same store
//! shape holds full blocks ([`BlockChain`]) or headers only ([`HeaderChain`]).
//!
//! Column families:
//! - `blocks`: record hash → bincode record
//! - `utxos`: txid → bincode [`UnspentOutputs`](echain_core::types::UnspentOutputs)
//!   (block chains only, see [`crate::utxo`])
//! - `metadata`: the `last_hash` tip pointer
//!
//! All multi-key mutations go through one atomic [`WriteBatch`].

use std::marker::PhantomData;
use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, DB, Options, WriteBatch};
use tracing::info;

use echain_core::constants::MAX_MESSAGE_SIZE;
use echain_core::error::{ChainStateError, EchainError};
use echain_core::types::{Block, BlockHeader, Hash256};

pub(crate) const CF_BLOCKS: &str = "blocks";
pub(crate) const CF_UTXOS: &str = "utxos";
pub(crate) const CF_METADATA: &str = "metadata";

const ALL_CFS: &[&str] = &[CF_BLOCKS, CF_UTXOS, CF_METADATA];

pub(crate) const META_LAST_HASH: &[u8] = b"last_hash";

pub(crate) fn storage_err(e: impl std::fmt::Display) -> EchainError {
    EchainError::Storage(e.to_string())
}

/// Something a [`ChainStore`] can hold: a block or a bare header.
pub trait ChainRecord: bincode::Encode + bincode::Decode<()> + Clone + Send + Sync + 'static {
    /// Name used in log lines.
    const KIND: &'static str;

    fn record_hash(&self) -> Hash256;

    fn prev_hash(&self) -> Hash256;

    fn header(&self) -> &BlockHeader;

    fn to_bytes(&self) -> Result<Vec<u8>, EchainError> {
        bincode::encode_to_vec(self, bincode::config::standard()).map_err(storage_err)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, EchainError> {
        let config = bincode::config::standard().with_limit::<MAX_MESSAGE_SIZE>();
        let (record, _) = bincode::decode_from_slice(bytes, config).map_err(storage_err)?;
        Ok(record)
    }

    /// Stage index updates that must commit atomically with this record
    /// becoming the tip.
    fn stage_index(&self, _store: &ChainStore<Self>, _batch: &mut WriteBatch) -> Result<(), EchainError> {
        Ok(())
    }
}

impl ChainRecord for Block {
    const KIND: &'static str = "block";

    fn record_hash(&self) -> Hash256 {
        self.hash()
    }

    fn prev_hash(&self) -> Hash256 {
        self.header.prev_hash
    }

    fn header(&self) -> &BlockHeader {
        &self.header
    }

    fn stage_index(&self, store: &ChainStore<Self>, batch: &mut WriteBatch) -> Result<(), EchainError> {
        store.stage_utxo_update(batch, self)
    }
}

impl ChainRecord for BlockHeader {
    const KIND: &'static str = "header";

    fn record_hash(&self) -> Hash256 {
        self.hash()
    }

    fn prev_hash(&self) -> Hash256 {
        self.prev_hash
    }

    fn header(&self) -> &BlockHeader {
        self
    }
}

/// Full-block chain with a UTXO index.
pub type BlockChain = ChainStore<Block>;

/// Header-only chain kept by SPV nodes.
pub type HeaderChain = ChainStore<BlockHeader>;

/// RocksDB-backed chain of `R` records.
pub struct ChainStore<R> {
    db: DB,
    _record: PhantomData<fn() -> R>,
}

impl<R: ChainRecord> ChainStore<R> {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EchainError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(storage_err)?;
        Ok(Self {
            db,
            _record: PhantomData,
        })
    }

    /// Open a store, committing `genesis` as the tip if it is empty.
    pub fn open_with_genesis(path: impl AsRef<Path>, genesis: &R) -> Result<Self, EchainError> {
        let store = Self::open(path)?;
        if store.last_hash()?.is_none() {
            store.store(genesis)?;
            info!(hash = %genesis.record_hash(), kind = R::KIND, "stored genesis");
        }
        Ok(store)
    }

    pub(crate) fn db(&self) -> &DB {
        &self.db
    }

    pub(crate) fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, EchainError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EchainError::Storage(format!("missing column family: {name}")))
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<R>, EchainError> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        match self.db.get_cf(cf, hash.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(R::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &Hash256) -> Result<bool, EchainError> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        Ok(self.db.get_pinned_cf(cf, hash.as_bytes()).map_err(storage_err)?.is_some())
    }

    /// The tip hash, or `None` before genesis is stored.
    pub fn last_hash(&self) -> Result<Option<Hash256>, EchainError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(cf, META_LAST_HASH).map_err(storage_err)? {
            Some(bytes) => {
                let bytes: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| EchainError::Storage("invalid last_hash length".into()))?;
                Ok(Some(Hash256(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn tip(&self) -> Result<Hash256, EchainError> {
        Ok(self.last_hash()?.ok_or(ChainStateError::EmptyChain)?)
    }

    pub fn tip_record(&self) -> Result<R, EchainError> {
        let tip = self.tip()?;
        self.get(&tip)?
            .ok_or_else(|| ChainStateError::BlockNotFound(tip.to_string()).into())
    }

    /// Persist `record`, advance the tip to it and apply its index updates,
    /// in one atomic batch.
    pub fn store(&self, record: &R) -> Result<(), EchainError> {
        let hash = record.record_hash();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf_handle(CF_BLOCKS)?, hash.as_bytes(), record.to_bytes()?);
        record.stage_index(self, &mut batch)?;
        batch.put_cf(self.cf_handle(CF_METADATA)?, META_LAST_HASH, hash.as_bytes());
        self.db.write(batch).map_err(storage_err)
    }

    /// Persist `record` without moving the tip or touching any index.
    pub fn put(&self, record: &R) -> Result<(), EchainError> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        self.db
            .put_cf(cf, record.record_hash().as_bytes(), record.to_bytes()?)
            .map_err(storage_err)
    }

    pub fn set_last_hash(&self, hash: &Hash256) -> Result<(), EchainError> {
        let cf = self.cf_handle(CF_METADATA)?;
        self.db.put_cf(cf, META_LAST_HASH, hash.as_bytes()).map_err(storage_err)
    }

    /// Records from the tip back to genesis.
    pub fn iter(&self) -> Result<ChainIter<'_, R>, EchainError> {
        Ok(ChainIter {
            store: self,
            next: self.last_hash()?,
        })
    }

    /// Records from `hash` back to genesis.
    pub fn iter_from(&self, hash: Hash256) -> ChainIter<'_, R> {
        ChainIter {
            store: self,
            next: Some(hash),
        }
    }

    /// Number of records from the tip to genesis inclusive.
    pub fn height(&self) -> Result<u64, EchainError> {
        let mut height = 0;
        for record in self.iter()? {
            record?;
            height += 1;
        }
        Ok(height)
    }

    /// Walk back from the tip looking for `target`.
    ///
    /// Returns whether it was found and the records newer than it, newest
    /// first. Genesis is never included.
    pub fn unmatched(&self, target: &Hash256) -> Result<(bool, Vec<R>), EchainError> {
        let mut newer = Vec::new();
        for record in self.iter()? {
            let record = record?;
            if record.record_hash() == *target {
                return Ok((true, newer));
            }
            if record.prev_hash().is_zero() {
                break;
            }
            newer.push(record);
        }
        Ok((false, newer))
    }

    /// Records for the given hashes, skipping unknown ones.
    pub fn records_from_hashes(&self, hashes: &[Hash256]) -> Result<Vec<R>, EchainError> {
        let mut records = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(record) = self.get(hash)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Whether the chain from `hash` reaches genesis without a gap.
    pub fn is_connected(&self, hash: &Hash256) -> Result<bool, EchainError> {
        let mut current = *hash;
        loop {
            match self.get(&current)? {
                Some(record) if record.prev_hash().is_zero() => return Ok(true),
                Some(record) => current = record.prev_hash(),
                None => return Ok(false),
            }
        }
    }
}

/// Backward walk over a [`ChainStore`], tip to genesis.
pub struct ChainIter<'a, R> {
    store: &'a ChainStore<R>,
    next: Option<Hash256>,
}

impl<R: ChainRecord> Iterator for ChainIter<'_, R> {
    type Item = Result<R, EchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match self.store.get(&hash) {
            Ok(Some(record)) => {
                let prev = record.prev_hash();
                if !prev.is_zero() {
                    self.next = Some(prev);
                }
                Some(Ok(record))
            }
            Ok(None) => Some(Err(ChainStateError::BlockNotFound(hash.to_string()).into())),
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echain_core::pow::{Target, mine};
    use echain_core::types::{PubkeyHash, Transaction};

    fn temp_store<R: ChainRecord>() -> (ChainStore<R>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path().join("chaindata")).unwrap();
        (store, dir)
    }

    fn easy() -> Target {
        Target::from_difficulty_bits(4)
    }

    fn block_on(prev: Hash256, height: u64) -> Block {
        let cb = Transaction::coinbase(PubkeyHash([0xAA; 20]), height).unwrap();
        let mut block = Block::new(prev, vec![cb], 1_000 + height).unwrap();
        mine(&mut block, &easy());
        block
    }

    /// Genesis plus `n` blocks, all stored through `store`.
    fn chain(store: &BlockChain, n: u64) -> Vec<Block> {
        let mut blocks = vec![block_on(Hash256::ZERO, 0)];
        store.store(&blocks[0]).unwrap();
        for h in 1..=n {
            let block = block_on(blocks[h as usize - 1].hash(), h);
            store.store(&block).unwrap();
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn empty_store_has_no_tip() {
        let (store, _dir) = temp_store::<Block>();
        assert_eq!(store.last_hash().unwrap(), None);
        assert!(matches!(
            store.tip(),
            Err(EchainError::ChainState(ChainStateError::EmptyChain))
        ));
        assert_eq!(store.height().unwrap(), 0);
    }

    #[test]
    fn open_with_genesis_only_stores_once() {
        let dir = tempfile::tempdir().unwrap();
        let genesis = block_on(Hash256::ZERO, 0);
        {
            let store = BlockChain::open_with_genesis(dir.path(), &genesis).unwrap();
            assert_eq!(store.tip().unwrap(), genesis.hash());
            store.store(&block_on(genesis.hash(), 1)).unwrap();
        }
        let store = BlockChain::open_with_genesis(dir.path(), &genesis).unwrap();
        assert_eq!(store.height().unwrap(), 2);
    }

    #[test]
    fn store_advances_tip_and_iterates_backwards() {
        let (store, _dir) = temp_store::<Block>();
        let blocks = chain(&store, 3);
        assert_eq!(store.tip().unwrap(), blocks[3].hash());
        assert_eq!(store.height().unwrap(), 4);

        let walked: Vec<Hash256> = store.iter().unwrap().map(|b| b.unwrap().hash()).collect();
        let expected: Vec<Hash256> = blocks.iter().rev().map(Block::hash).collect();
        assert_eq!(walked, expected);
        assert_eq!(store.tip_record().unwrap(), blocks[3]);
    }

    #[test]
    fn put_does_not_move_tip() {
        let (store, _dir) = temp_store::<Block>();
        let blocks = chain(&store, 1);
        let orphan = block_on(blocks[1].hash(), 2);
        store.put(&orphan).unwrap();
        assert!(store.contains(&orphan.hash()).unwrap());
        assert_eq!(store.tip().unwrap(), blocks[1].hash());

        store.set_last_hash(&orphan.hash()).unwrap();
        assert_eq!(store.height().unwrap(), 3);
    }

    #[test]
    fn unmatched_found_returns_newer_newest_first() {
        let (store, _dir) = temp_store::<Block>();
        let blocks = chain(&store, 4);
        let (found, newer) = store.unmatched(&blocks[1].hash()).unwrap();
        assert!(found);
        let hashes: Vec<Hash256> = newer.iter().map(Block::hash).collect();
        assert_eq!(hashes, vec![blocks[4].hash(), blocks[3].hash(), blocks[2].hash()]);
    }

    #[test]
    fn unmatched_at_tip_is_empty() {
        let (store, _dir) = temp_store::<Block>();
        let blocks = chain(&store, 2);
        assert_eq!(store.unmatched(&blocks[2].hash()).unwrap(), (true, vec![]));
    }

    #[test]
    fn unmatched_unknown_excludes_genesis() {
        let (store, _dir) = temp_store::<Block>();
        let blocks = chain(&store, 2);
        let (found, newer) = store.unmatched(&Hash256([7; 32])).unwrap();
        assert!(!found);
        assert_eq!(newer.len(), 2);
        assert!(newer.iter().all(|b| b.hash() != blocks[0].hash()));
    }

    #[test]
    fn records_from_hashes_skips_unknown() {
        let (store, _dir) = temp_store::<Block>();
        let blocks = chain(&store, 2);
        let found = store
            .records_from_hashes(&[blocks[2].hash(), Hash256([1; 32]), blocks[1].hash()])
            .unwrap();
        assert_eq!(found, vec![blocks[2].clone(), blocks[1].clone()]);
    }

    #[test]
    fn connectivity() {
        let (store, _dir) = temp_store::<Block>();
        let blocks = chain(&store, 1);
        let gap_parent = block_on(blocks[1].hash(), 2);
        let dangling = block_on(gap_parent.hash(), 3);
        store.put(&dangling).unwrap();
        assert!(store.is_connected(&blocks[1].hash()).unwrap());
        assert!(!store.is_connected(&dangling.hash()).unwrap());
        store.put(&gap_parent).unwrap();
        assert!(store.is_connected(&dangling.hash()).unwrap());
    }

    #[test]
    fn header_chain_stores_headers() {
        let (store, _dir) = temp_store::<BlockHeader>();
        let genesis = block_on(Hash256::ZERO, 0);
        let next = block_on(genesis.hash(), 1);
        store.store(&genesis.header).unwrap();
        store.store(&next.header).unwrap();
        assert_eq!(store.tip().unwrap(), next.hash());
        assert_eq!(store.get(&genesis.hash()).unwrap(), Some(genesis.header.clone()));
        assert_eq!(store.height().unwrap(), 2);
    }

    #[test]
    fn corrupt_record_length_is_an_error() {
        let block = block_on(Hash256::ZERO, 0);
        let mut bytes = bincode::encode_to_vec(&block.header, bincode::config::standard()).unwrap();
        bytes.push(253);
        bytes.extend_from_slice(&(1u64 << 40).to_le_bytes());
        assert!(matches!(Block::from_bytes(&bytes), Err(EchainError::Storage(_))));
    }
}
