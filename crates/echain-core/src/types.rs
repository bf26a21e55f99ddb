//! Core protocol types: transactions, blocks, unspent outputs.
//!
//! Everything here derives both serde and bincode. Bincode with the standard
//! config is the canonical encoding for hashing and for the wire.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::COINBASE_REWARD;
use crate::crypto::{double_sha256, hash160};
use crate::error::TransactionError;
use crate::merkle::{MerkleProof, MerkleTree, merkle_root};

/// A 32-byte hash value (block hashes, transaction hashes, Merkle nodes).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Marks the missing parent of the genesis block.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// RIPEMD160(SHA256(pubkey)): the 20-byte identity an output is locked to.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PubkeyHash(pub [u8; 20]);

impl PubkeyHash {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PubkeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Hash of the transaction holding the output.
    pub txid: Hash256,
    /// Position of the output within that transaction.
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Data that unlocks a pay-to-pubkey-hash output.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UnlockingScript {
    /// ECDSA signature as `r || s` (64 bytes).
    pub signature: Vec<u8>,
    /// Uncompressed SEC1 public key (65 bytes).
    pub pubkey: Vec<u8>,
}

/// Pay-to-pubkey-hash lock.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct LockingScript {
    pub pubkey_hash: PubkeyHash,
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub unlocking: UnlockingScript,
}

impl TxInput {
    /// An unsigned input carrying the spender's public key.
    pub fn new(previous_output: OutPoint, pubkey: Vec<u8>) -> Self {
        Self {
            previous_output,
            unlocking: UnlockingScript {
                signature: Vec::new(),
                pubkey,
            },
        }
    }

    /// Copy of this input with the signature cleared.
    pub fn without_signature(&self) -> Self {
        Self {
            previous_output: self.previous_output,
            unlocking: UnlockingScript {
                signature: Vec::new(),
                pubkey: self.unlocking.pubkey.clone(),
            },
        }
    }

    /// Whether the unlocking pubkey hashes to `pubkey_hash`.
    pub fn is_signed_by(&self, pubkey_hash: &PubkeyHash) -> bool {
        hash160(&self.unlocking.pubkey) == *pubkey_hash
    }
}

/// A transaction output, creating a new UTXO.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    pub value: u64,
    pub locking: LockingScript,
}

impl TxOutput {
    pub fn new(value: u64, pubkey_hash: PubkeyHash) -> Self {
        Self {
            value,
            locking: LockingScript { pubkey_hash },
        }
    }

    pub fn is_bound_to(&self, pubkey_hash: &PubkeyHash) -> bool {
        self.locking.pubkey_hash == *pubkey_hash
    }
}

/// Unspent outputs of one transaction, keyed by output index.
pub type UnspentOutputs = BTreeMap<u32, TxOutput>;

/// A transaction transferring value between pubkey hashes.
///
/// `hash` is fixed by [`set_hash`](Self::set_hash) once the inputs are signed
/// and never changes afterwards.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub hash: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Carries the block height for coinbases and a creation time for transfers.
    pub lock_time: u64,
}

impl Transaction {
    /// An unsigned, unhashed transaction.
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, lock_time: u64) -> Self {
        Self {
            hash: Hash256::ZERO,
            inputs,
            outputs,
            lock_time,
        }
    }

    /// Build a coinbase paying [`COINBASE_REWARD`] to `reward`.
    ///
    /// `lock_time` should be the height of the block it goes into so that
    /// repeated rewards to one address get distinct hashes.
    pub fn coinbase(reward: PubkeyHash, lock_time: u64) -> Result<Self, TransactionError> {
        let mut tx = Self::new(Vec::new(), vec![TxOutput::new(COINBASE_REWARD, reward)], lock_time);
        tx.set_hash()?;
        Ok(tx)
    }

    /// Double SHA-256 of the bincode encoding of
    /// `(inputs with signatures cleared, outputs, lock_time)`.
    pub fn compute_hash(&self) -> Result<Hash256, TransactionError> {
        let inputs: Vec<TxInput> = self.inputs.iter().map(TxInput::without_signature).collect();
        let encoded = bincode::encode_to_vec(
            (inputs, self.outputs.clone(), self.lock_time),
            bincode::config::standard(),
        )
        .map_err(|e| TransactionError::Serialization(e.to_string()))?;
        Ok(double_sha256(&encoded))
    }

    pub fn set_hash(&mut self) -> Result<(), TransactionError> {
        self.hash = self.compute_hash()?;
        Ok(())
    }

    /// Leaf value committed by the block's Merkle root: double SHA-256 of the
    /// full serialized transaction.
    pub fn merkle_leaf(&self) -> Result<Hash256, TransactionError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))?;
        Ok(double_sha256(&encoded))
    }

    /// A coinbase has no inputs.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Whether any input is signed by, or any output is bound to, `pubkey_hash`.
    pub fn touches(&self, pubkey_hash: &PubkeyHash) -> bool {
        self.inputs.iter().any(|i| i.is_signed_by(pubkey_hash))
            || self.outputs.iter().any(|o| o.is_bound_to(pubkey_hash))
    }
}

/// Block header. Its hash is the block hash; the Merkle root binds the body.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Hash of the previous block, [`Hash256::ZERO`] for genesis.
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    pub nonce: u64,
}

impl BlockHeader {
    /// Serialized size for hashing: two hashes and two u64 fields.
    const HASH_SIZE: usize = 2 * 32 + 2 * 8;

    /// Double SHA-256 over `prev_hash || merkle_root || timestamp || nonce`,
    /// integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        double_sha256(&data)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }
}

/// A complete block: header plus ordered transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// First transaction must be the coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble an unmined block, computing the Merkle root once.
    pub fn new(
        prev_hash: Hash256,
        transactions: Vec<Transaction>,
        timestamp: u64,
    ) -> Result<Self, TransactionError> {
        let merkle_root = merkle_root(&Self::leaves(&transactions)?);
        Ok(Self {
            header: BlockHeader {
                prev_hash,
                merkle_root,
                timestamp,
                nonce: 0,
            },
            transactions,
        })
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Recompute the Merkle root from the transaction list.
    pub fn compute_merkle_root(&self) -> Result<Hash256, TransactionError> {
        Ok(merkle_root(&Self::leaves(&self.transactions)?))
    }

    /// Inclusion proof for the transaction with hash `txid`.
    pub fn merkle_proof(&self, txid: &Hash256) -> Result<Option<MerkleProof>, TransactionError> {
        let Some(position) = self.transactions.iter().position(|tx| tx.hash == *txid) else {
            return Ok(None);
        };
        let tree = MerkleTree::from_leaves(&Self::leaves(&self.transactions)?);
        Ok(tree.proof(position))
    }

    fn leaves(transactions: &[Transaction]) -> Result<Vec<Hash256>, TransactionError> {
        transactions.iter().map(Transaction::merkle_leaf).collect()
    }
}
