//! Transaction and block validation.
//!
//! Two levels:
//!
//! - **Structural** ([`check_block`]): proof-of-work, coinbase placement,
//!   reward, transaction hashes and the Merkle root. No external state.
//! - **Contextual** ([`validate_transaction`], [`validate_block_transactions`]):
//!   resolves inputs through a [`UtxoView`] to check ownership, signatures
//!   and value conservation.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::constants::COINBASE_REWARD;
use crate::crypto::{input_signing_hash, verify_signature};
use crate::error::{BlockError, EchainError, TransactionError};
use crate::pow::Target;
use crate::types::{Block, Hash256, OutPoint, Transaction, TxOutput, UnspentOutputs};

/// Read access to the set of unspent outputs.
pub trait UtxoView {
    /// The output at `outpoint` if it exists and is unspent.
    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>, EchainError>;
}

impl UtxoView for BTreeMap<Hash256, UnspentOutputs> {
    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>, EchainError> {
        Ok(self
            .get(&outpoint.txid)
            .and_then(|outputs| outputs.get(&outpoint.index))
            .cloned())
    }
}

impl<V: UtxoView + ?Sized> UtxoView for &V {
    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>, EchainError> {
        (**self).unspent_output(outpoint)
    }
}

/// A [`UtxoView`] overlay reflecting the transactions applied so far in a block.
pub struct BlockView<'a, V: ?Sized> {
    base: &'a V,
    created: HashMap<OutPoint, TxOutput>,
    spent: HashSet<OutPoint>,
}

impl<'a, V: UtxoView + ?Sized> BlockView<'a, V> {
    pub fn new(base: &'a V) -> Self {
        Self {
            base,
            created: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    /// Mark `tx`'s inputs spent and its outputs available.
    pub fn apply(&mut self, tx: &Transaction) {
        for input in &tx.inputs {
            self.created.remove(&input.previous_output);
            self.spent.insert(input.previous_output);
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            self.created
                .insert(OutPoint::new(tx.hash, index as u32), output.clone());
        }
    }
}

impl<V: UtxoView + ?Sized> UtxoView for BlockView<'_, V> {
    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>, EchainError> {
        if let Some(output) = self.created.get(outpoint) {
            return Ok(Some(output.clone()));
        }
        if self.spent.contains(outpoint) {
            return Ok(None);
        }
        self.base.unspent_output(outpoint)
    }
}

/// Check that every input resolves, is owned by its signer and carries a
/// valid signature. Coinbase transactions always pass.
pub fn verify_transaction<V: UtxoView + ?Sized>(tx: &Transaction, view: &V) -> Result<(), EchainError> {
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for (index, input) in tx.inputs.iter().enumerate() {
        let outpoint = &input.previous_output;
        if !seen.insert(*outpoint) {
            return Err(TransactionError::DuplicateInput(outpoint.to_string()).into());
        }

        let Some(spent) = view.unspent_output(outpoint)? else {
            return Err(TransactionError::DanglingReference(outpoint.to_string()).into());
        };

        if !input.is_signed_by(&spent.locking.pubkey_hash) {
            return Err(TransactionError::InvalidKey { index }.into());
        }

        let hash = input_signing_hash(input)?;
        verify_signature(&input.unlocking.pubkey, &hash, &input.unlocking.signature)
            .map_err(|_| TransactionError::InvalidSignature { index })?;
    }
    Ok(())
}

/// Check value conservation and return the fee (inputs minus outputs).
pub fn check_amounts<V: UtxoView + ?Sized>(tx: &Transaction, view: &V) -> Result<u64, EchainError> {
    let outputs = tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;
    if tx.is_coinbase() {
        return Ok(0);
    }

    let mut inputs = 0u64;
    for input in &tx.inputs {
        let spent = view
            .unspent_output(&input.previous_output)?
            .ok_or_else(|| TransactionError::DanglingReference(input.previous_output.to_string()))?;
        inputs = inputs
            .checked_add(spent.value)
            .ok_or(TransactionError::ValueOverflow)?;
    }

    if inputs < outputs {
        return Err(TransactionError::Overspend { inputs, outputs }.into());
    }
    Ok(inputs - outputs)
}

/// Full contextual validation of a single transaction. Returns the fee.
pub fn validate_transaction<V: UtxoView + ?Sized>(tx: &Transaction, view: &V) -> Result<u64, EchainError> {
    if tx.outputs.is_empty() {
        return Err(TransactionError::NoOutputs.into());
    }
    let computed = tx.compute_hash()?;
    if computed != tx.hash {
        return Err(TransactionError::HashMismatch {
            stored: tx.hash.to_string(),
            computed: computed.to_string(),
        }
        .into());
    }
    verify_transaction(tx, view)?;
    check_amounts(tx, view)
}

/// Structural block checks that need no chain state.
pub fn check_block(block: &Block, target: &Target) -> Result<(), BlockError> {
    if !target.is_met_by(&block.hash()) {
        return Err(BlockError::InvalidPoW);
    }

    let Some(coinbase) = block.coinbase() else {
        return Err(BlockError::NoTransactions);
    };
    if !coinbase.is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(BlockError::MultipleCoinbase);
    }

    let reward = coinbase
        .total_output_value()
        .ok_or(BlockError::Transaction {
            index: 0,
            source: TransactionError::ValueOverflow,
        })?;
    if reward > COINBASE_REWARD {
        return Err(BlockError::InvalidReward {
            got: reward,
            max: COINBASE_REWARD,
        });
    }

    for (index, tx) in block.transactions.iter().enumerate() {
        let computed = tx
            .compute_hash()
            .map_err(|source| BlockError::Transaction { index, source })?;
        if computed != tx.hash {
            return Err(BlockError::TxHashMismatch(index));
        }
    }

    let root = block
        .compute_merkle_root()
        .map_err(|source| BlockError::Transaction { index: 0, source })?;
    if root != block.header.merkle_root {
        return Err(BlockError::InvalidMerkleRoot);
    }
    Ok(())
}

/// Validate every transaction of `block` in order against `view`, letting
/// later transactions spend outputs created earlier in the block.
pub fn validate_block_transactions<V: UtxoView + ?Sized>(block: &Block, view: &V) -> Result<(), EchainError> {
    let mut overlay = BlockView::new(view);
    for (index, tx) in block.transactions.iter().enumerate() {
        if !tx.is_coinbase() {
            validate_transaction(tx, &overlay).map_err(|e| match e {
                EchainError::Transaction(source) => BlockError::Transaction { index, source }.into(),
                other => other,
            })?;
        }
        overlay.apply(tx);
    }
    Ok(())
}
