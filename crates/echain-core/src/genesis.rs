//! Genesis block construction.
//!
//! The genesis block is a function of the reward pubkey hash and the target
//! only, so every node configured with the same genesis address and
//! difficulty computes the identical block.

use crate::constants::GENESIS_TIMESTAMP_MS;
use crate::error::TransactionError;
use crate::pow::{Target, mine};
use crate::types::{Block, Hash256, PubkeyHash, Transaction};

/// Build and mine the genesis block paying the coinbase to `reward`.
pub fn genesis_block(reward: PubkeyHash, target: &Target) -> Result<Block, TransactionError> {
    let coinbase = Transaction::coinbase(reward, 0)?;
    let mut block = Block::new(Hash256::ZERO, vec![coinbase], GENESIS_TIMESTAMP_MS)?;
    mine(&mut block, target);
    Ok(block)
}
