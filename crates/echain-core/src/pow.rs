//! Proof-of-work target and nonce search.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::{Block, Hash256};

/// How many nonces [`mine_cancellable`] tries between cancellation checks.
pub const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// A 256-bit big-endian target. A block is valid when its hash is strictly
/// below the target.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Target([u8; 32]);

impl Target {
    /// `2^(256 - bits)`. `bits` is clamped to `1..=256`.
    ///
    /// # Examples
    ///
    /// ```
    /// use echain_core::pow::Target;
    /// let target = Target::from_difficulty_bits(1);
    /// assert_eq!(target.as_bytes()[0], 0x80);
    /// ```
    pub fn from_difficulty_bits(bits: u32) -> Self {
        let bits = bits.clamp(1, 256);
        let position = (256 - bits) as usize;
        let mut bytes = [0u8; 32];
        bytes[31 - position / 8] = 1 << (position % 8);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether `hash`, read as a big-endian integer, is below the target.
    pub fn is_met_by(&self, hash: &Hash256) -> bool {
        hash.as_bytes() < &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Search nonces from 1 upward until the header hash meets `target`.
///
/// The search is unbounded. Returns the winning hash, with the nonce left in
/// `block.header.nonce`.
pub fn mine(block: &mut Block, target: &Target) -> Hash256 {
    let mut nonce = 1u64;
    loop {
        block.header.nonce = nonce;
        let hash = block.hash();
        if target.is_met_by(&hash) {
            return hash;
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// Like [`mine`], but gives up once `cancel` is set.
///
/// `cancel` is polled every [`CANCEL_CHECK_INTERVAL`] nonces. Returns `None`
/// when cancelled.
pub fn mine_cancellable(block: &mut Block, target: &Target, cancel: &AtomicBool) -> Option<Hash256> {
    let mut nonce = 1u64;
    loop {
        if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return None;
        }
        block.header.nonce = nonce;
        let hash = block.hash();
        if target.is_met_by(&hash) {
            return Some(hash);
        }
        nonce = nonce.wrapping_add(1);
    }
}
