//! # echain-node — node roles, RocksDB chain storage and the UTXO index.
//!
//! - [`storage::ChainStore`]: block or header chain backed by RocksDB
//! - [`utxo`]: the unspent-output index kept beside the block chain
//! - [`node::Node`]: full, miner and SPV roles behind one message handler
//! - [`config::NodeConfig`]: node configuration

pub mod config;
pub mod full;
pub mod miner;
pub mod node;
pub mod spv;
pub mod storage;
pub mod sync;
pub mod utxo;

pub use config::NodeConfig;
pub use node::Node;
pub use storage::{BlockChain, ChainStore, HeaderChain};
