//! In-memory pool of unconfirmed transactions (mempool).
//!
//! Transactions are kept in arrival order, which is also the order a miner
//! packs them into a block. A spent-outpoint index rejects two pool
//! transactions spending the same output.
//!
//! Transactions must be validated by the caller before insertion (using
//! [`validate_transaction`](crate::validation::validate_transaction)).
//! The mempool only checks for duplicates, conflicts and its count limit.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::MempoolError;
use crate::types::{Block, Hash256, OutPoint, Transaction};

/// Default maximum number of transactions in the mempool.
pub const DEFAULT_MAX_COUNT: usize = 5_000;

/// A transaction stored in the mempool.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    /// Inputs minus outputs. Not credited to the miner.
    pub fee: u64,
    sequence: u64,
}

/// In-memory pool of unconfirmed transactions.
///
/// Not thread-safe; callers wrap it in a `Mutex`.
#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    /// Arrival sequence → txid.
    order: BTreeMap<u64, Hash256>,
    /// Spent outpoint → txid of the pool transaction that spends it.
    by_outpoint: HashMap<OutPoint, Hash256>,
    next_sequence: u64,
    max_count: usize,
}

impl Mempool {
    pub fn new(max_count: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            by_outpoint: HashMap::new(),
            next_sequence: 0,
            max_count,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_COUNT)
    }

    /// Insert a validated transaction. Returns its hash.
    pub fn insert(&mut self, tx: Transaction, fee: u64) -> Result<Hash256, MempoolError> {
        let txid = tx.hash;
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()));
        }

        for input in &tx.inputs {
            if let Some(existing) = self.by_outpoint.get(&input.previous_output) {
                return Err(MempoolError::Conflict {
                    new_txid: txid.to_string(),
                    existing_txid: existing.to_string(),
                    outpoint: input.previous_output.to_string(),
                });
            }
        }

        if self.entries.len() >= self.max_count {
            return Err(MempoolError::PoolFull);
        }

        for input in &tx.inputs {
            self.by_outpoint.insert(input.previous_output, txid);
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.order.insert(sequence, txid);
        self.entries.insert(txid, MempoolEntry { tx, fee, sequence });
        Ok(txid)
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            self.by_outpoint.remove(&input.previous_output);
        }
        self.order.remove(&entry.sequence);
        Some(entry)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// All pool transactions in arrival order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.order
            .values()
            .filter_map(|txid| self.entries.get(txid))
            .map(|entry| entry.tx.clone())
            .collect()
    }

    /// Remove transactions confirmed in `block` and any pool transactions
    /// that spend an outpoint the block spends.
    pub fn remove_confirmed_block(&mut self, block: &Block) {
        let mut stale = HashSet::new();
        for tx in &block.transactions {
            stale.insert(tx.hash);
            for input in &tx.inputs {
                if let Some(txid) = self.by_outpoint.get(&input.previous_output) {
                    stale.insert(*txid);
                }
            }
        }
        for txid in stale {
            self.remove(&txid);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn total_fees(&self) -> u64 {
        self.entries.values().map(|e| e.fee).sum()
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::with_defaults()
    }
}
