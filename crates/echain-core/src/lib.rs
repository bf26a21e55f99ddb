//! # echain-core
//! Foundation types for EChain: hashing, addresses, transactions, blocks,
//! Merkle proofs, proof-of-work, validation, the mempool and bloom filters.

pub mod address;
pub mod bloom;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod genesis;
pub mod mempool;
pub mod merkle;
pub mod pow;
pub mod types;
pub mod validation;
