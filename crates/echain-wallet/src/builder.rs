//! Output selection and transfer construction.
//!
//! Selection is first-fit over the outputs a node reported for the sender,
//! in transaction-hash order, stopping as soon as the amount is covered.
//! Anything above the amount comes back to the sender as a change output.

use std::collections::BTreeMap;

use echain_core::address::Address;
use echain_core::crypto::sign_transaction;
use echain_core::types::{Hash256, OutPoint, PubkeyHash, Transaction, TxInput, TxOutput, UnspentOutputs};

use crate::error::WalletError;
use crate::wallet::Wallet;

/// Accumulate outputs locked to `pkh` until `amount` is reached.
///
/// Returns the accumulated value and the chosen outpoints. The value is
/// below `amount` when the owner cannot afford it.
pub fn select_outputs(
    utxos: &BTreeMap<Hash256, UnspentOutputs>,
    pkh: &PubkeyHash,
    amount: u64,
) -> (u64, Vec<OutPoint>) {
    let mut accumulated = 0u64;
    let mut selected = Vec::new();
    for (txid, outputs) in utxos {
        for (index, output) in outputs {
            if accumulated >= amount {
                return (accumulated, selected);
            }
            if output.is_bound_to(pkh) {
                accumulated = accumulated.saturating_add(output.value);
                selected.push(OutPoint::new(*txid, *index));
            }
        }
    }
    (accumulated, selected)
}

/// Build and sign a transaction paying `amount` to `to` from `wallet`'s
/// outputs in `utxos`.
pub fn build_transfer(
    wallet: &Wallet,
    utxos: &BTreeMap<Hash256, UnspentOutputs>,
    to: &Address,
    amount: u64,
    lock_time: u64,
) -> Result<Transaction, WalletError> {
    if amount == 0 {
        return Err(WalletError::InvalidAmount("amount must be non-zero".into()));
    }

    let sender = wallet.pubkey_hash();
    let (have, selected) = select_outputs(utxos, &sender, amount);
    if have < amount {
        return Err(WalletError::InsufficientFunds { have, need: amount });
    }

    let pubkey = wallet.keypair().public_key().to_bytes();
    let inputs = selected
        .into_iter()
        .map(|outpoint| TxInput::new(outpoint, pubkey.clone()))
        .collect();

    let mut outputs = vec![TxOutput::new(amount, to.pubkey_hash())];
    if have > amount {
        outputs.push(TxOutput::new(have - amount, sender));
    }

    let mut tx = Transaction::new(inputs, outputs, lock_time);
    sign_transaction(&mut tx, wallet.keypair())?;
    tx.set_hash()?;
    Ok(tx)
}
