//! UTXO index over the `utxos` column family.
//!
//! Keys are transaction hashes; values are the bincode-encoded
//! [`UnspentOutputs`] still available from that transaction. A transaction
//! whose outputs are all spent has no key.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rocksdb::{IteratorMode, WriteBatch};
use tracing::{debug, info};

use echain_core::constants::MAX_MESSAGE_SIZE;
use echain_core::error::EchainError;
use echain_core::types::{Block, Hash256, OutPoint, PubkeyHash, TxOutput, UnspentOutputs};
use echain_core::validation::UtxoView;

use crate::storage::{BlockChain, CF_METADATA, CF_UTXOS, META_LAST_HASH, storage_err};

fn encode_outputs(outputs: &UnspentOutputs) -> Result<Vec<u8>, EchainError> {
    bincode::encode_to_vec(outputs, bincode::config::standard()).map_err(storage_err)
}

fn decode_outputs(bytes: &[u8]) -> Result<UnspentOutputs, EchainError> {
    let config = bincode::config::standard().with_limit::<MAX_MESSAGE_SIZE>();
    let (outputs, _) = bincode::decode_from_slice(bytes, config).map_err(storage_err)?;
    Ok(outputs)
}

fn decode_txid(bytes: &[u8]) -> Result<Hash256, EchainError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EchainError::Storage("invalid utxo key length".into()))?;
    Ok(Hash256(bytes))
}

impl BlockChain {
    /// Unspent outputs of one transaction.
    pub fn unspent_outputs(&self, txid: &Hash256) -> Result<Option<UnspentOutputs>, EchainError> {
        let cf = self.cf_handle(CF_UTXOS)?;
        match self.db().get_cf(cf, txid.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(decode_outputs(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stage the index changes for connecting `block` on top of the tip.
    ///
    /// Outputs created and spent within the block never reach the index.
    pub(crate) fn stage_utxo_update(&self, batch: &mut WriteBatch, block: &Block) -> Result<(), EchainError> {
        let mut created: BTreeMap<Hash256, UnspentOutputs> = BTreeMap::new();
        let mut stored: HashMap<Hash256, UnspentOutputs> = HashMap::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let OutPoint { txid, index } = input.previous_output;
                    if let Some(outputs) = created.get_mut(&txid) {
                        outputs.remove(&index);
                        continue;
                    }
                    if !stored.contains_key(&txid) {
                        let outputs = self.unspent_outputs(&txid)?.unwrap_or_default();
                        stored.insert(txid, outputs);
                    }
                    if let Some(outputs) = stored.get_mut(&txid) {
                        outputs.remove(&index);
                    }
                }
            }
            let outputs = tx
                .outputs
                .iter()
                .enumerate()
                .map(|(i, out)| (i as u32, out.clone()))
                .collect();
            created.insert(tx.hash, outputs);
        }

        let cf = self.cf_handle(CF_UTXOS)?;
        for (txid, outputs) in stored.iter().chain(created.iter()) {
            if outputs.is_empty() {
                batch.delete_cf(cf, txid.as_bytes());
            } else {
                batch.put_cf(cf, txid.as_bytes(), encode_outputs(outputs)?);
            }
        }
        Ok(())
    }

    /// Rebuild the index from the chain, optionally moving the tip first.
    ///
    /// Everything, including the new tip, is written in one batch.
    pub fn reindex(&self, new_tip: Option<Hash256>) -> Result<usize, EchainError> {
        let tip = match new_tip {
            Some(hash) => hash,
            None => self.tip()?,
        };

        let mut unspent: BTreeMap<Hash256, UnspentOutputs> = BTreeMap::new();
        let mut spent: HashMap<Hash256, BTreeSet<u32>> = HashMap::new();

        for block in self.iter_from(tip) {
            let block = block?;
            for tx in block.transactions.iter().rev() {
                let spent_here = spent.get(&tx.hash);
                let outputs: UnspentOutputs = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(i, out)| (i as u32, out))
                    .filter(|(i, _)| !spent_here.is_some_and(|s| s.contains(i)))
                    .map(|(i, out)| (i, out.clone()))
                    .collect();
                if !outputs.is_empty() {
                    unspent.insert(tx.hash, outputs);
                }
                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent
                            .entry(input.previous_output.txid)
                            .or_default()
                            .insert(input.previous_output.index);
                    }
                }
            }
        }

        let cf = self.cf_handle(CF_UTXOS)?;
        let mut batch = WriteBatch::default();
        for item in self.db().iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(storage_err)?;
            batch.delete_cf(cf, key);
        }
        for (txid, outputs) in &unspent {
            batch.put_cf(cf, txid.as_bytes(), encode_outputs(outputs)?);
        }
        if let Some(hash) = new_tip {
            batch.put_cf(self.cf_handle(CF_METADATA)?, META_LAST_HASH, hash.as_bytes());
        }
        self.db().write(batch).map_err(storage_err)?;

        info!(tip = %tip, transactions = unspent.len(), "reindexed utxo set");
        Ok(unspent.len())
    }

    /// Walk the index collecting `pkh` outputs until `amount` is covered.
    ///
    /// Returns the accumulated value, which is below `amount` when the
    /// owner cannot afford it.
    pub fn find_spendable(
        &self,
        pkh: &PubkeyHash,
        amount: u64,
    ) -> Result<(u64, BTreeMap<Hash256, UnspentOutputs>), EchainError> {
        let mut accumulated = 0u64;
        let mut selected: BTreeMap<Hash256, UnspentOutputs> = BTreeMap::new();
        'scan: for entry in self.utxo_entries()? {
            let (txid, outputs) = entry?;
            for (index, output) in outputs {
                if accumulated >= amount {
                    break 'scan;
                }
                if output.is_bound_to(pkh) {
                    accumulated = accumulated.saturating_add(output.value);
                    selected.entry(txid).or_default().insert(index, output);
                }
            }
        }
        debug!(%pkh, amount, accumulated, "selected spendable outputs");
        Ok((accumulated, selected))
    }

    /// Every unspent output locked to `pkh`.
    pub fn find_utxos(&self, pkh: &PubkeyHash) -> Result<BTreeMap<Hash256, UnspentOutputs>, EchainError> {
        let mut found = BTreeMap::new();
        for entry in self.utxo_entries()? {
            let (txid, outputs) = entry?;
            let owned: UnspentOutputs = outputs
                .into_iter()
                .filter(|(_, out)| out.is_bound_to(pkh))
                .collect();
            if !owned.is_empty() {
                found.insert(txid, owned);
            }
        }
        Ok(found)
    }

    pub fn balance(&self, pkh: &PubkeyHash) -> Result<u64, EchainError> {
        Ok(self
            .find_utxos(pkh)?
            .values()
            .flat_map(|outputs| outputs.values())
            .map(|out| out.value)
            .sum())
    }

    /// The whole index, decoded. For tests and diagnostics; request
    /// handlers use [`find_utxos`](Self::find_utxos).
    pub fn all_utxos(&self) -> Result<BTreeMap<Hash256, UnspentOutputs>, EchainError> {
        self.utxo_entries()?.collect()
    }

    /// Index entries in key order, decoded one at a time.
    fn utxo_entries(
        &self,
    ) -> Result<impl Iterator<Item = Result<(Hash256, UnspentOutputs), EchainError>> + '_, EchainError> {
        let cf = self.cf_handle(CF_UTXOS)?;
        Ok(self.db().iterator_cf(cf, IteratorMode::Start).map(|item| {
            let (key, value) = item.map_err(storage_err)?;
            Ok((decode_txid(&key)?, decode_outputs(&value)?))
        }))
    }
}

impl UtxoView for BlockChain {
    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>, EchainError> {
        Ok(self
            .unspent_outputs(&outpoint.txid)?
            .and_then(|mut outputs| outputs.remove(&outpoint.index)))
    }
}
