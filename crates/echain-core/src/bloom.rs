//! Bloom filter of monitored pubkey hashes.
//!
//! SPV nodes load one of these into each full peer. The full node proves to
//! the SPV node every transaction the filter matches. False positives only
//! cost bandwidth; the SPV node re-checks ownership exactly.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::hash160;
use crate::types::{PubkeyHash, Transaction};

/// Upper bound on hash functions, whatever the requested rate.
pub const MAX_HASH_FUNCS: u32 = 32;

/// Upper bound on filter size in bits (1 MiB of filter data).
pub const MAX_FILTER_BITS: u64 = 8 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size a filter for `items` entries at false-positive rate `fp_rate`.
    pub fn with_capacity(items: usize, fp_rate: f64) -> Self {
        let n = items.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_bits = m.clamp(8, MAX_FILTER_BITS);
        let k = ((num_bits as f64 / n) * ln2).round() as u32;
        let num_hashes = k.clamp(1, MAX_HASH_FUNCS);

        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
        }
    }

    pub fn insert(&mut self, item: &[u8]) {
        let positions: Vec<u64> = self.positions(item).collect();
        for index in positions {
            self.bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    /// May return true for items never inserted, never false for inserted ones.
    pub fn contains(&self, item: &[u8]) -> bool {
        self.positions(item)
            .all(|index| self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0)
    }

    pub fn insert_pubkey_hash(&mut self, pubkey_hash: &PubkeyHash) {
        self.insert(pubkey_hash.as_bytes());
    }

    /// Whether any output is bound to, or any input pubkey hashes to, an
    /// element of the filter.
    pub fn matches_transaction(&self, tx: &Transaction) -> bool {
        tx.outputs
            .iter()
            .any(|out| self.contains(out.locking.pubkey_hash.as_bytes()))
            || tx
                .inputs
                .iter()
                .any(|input| self.contains(hash160(&input.unlocking.pubkey).as_bytes()))
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Filter received from the network is well-formed.
    pub fn is_consistent(&self) -> bool {
        self.num_bits > 0
            && self.num_bits <= MAX_FILTER_BITS
            && self.bits.len() as u64 == self.num_bits.div_ceil(8)
            && (1..=MAX_HASH_FUNCS).contains(&self.num_hashes)
    }

    /// Double hashing: position `i` is `h1 + i * h2 (mod m)`.
    fn positions(&self, item: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(item);
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        second.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(first);
        let h2 = u64::from_le_bytes(second);
        let m = self.num_bits.max(1);
        (0..u64::from(self.num_hashes)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }
}
