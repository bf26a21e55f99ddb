//! # echain-wallet — keys, transfers and the node client.
//!
//! A [`Wallet`] holds one secp256k1 key. Transfers are assembled from the
//! unspent outputs a full node reports over `getutxo`, signed locally and
//! broadcast with `newtxn`. SPV nodes are told which addresses to watch with
//! `newaddr`.
//!
//! # Modules
//!
//! - [`error`] — `WalletError` enum
//! - [`wallet`] — key ownership
//! - [`builder`] — output selection and transfer construction
//! - [`client`] — request/broadcast against running nodes

pub mod builder;
pub mod client;
pub mod error;
pub mod wallet;

pub use builder::{build_transfer, select_outputs};
pub use client::WalletClient;
pub use error::WalletError;
pub use wallet::Wallet;
