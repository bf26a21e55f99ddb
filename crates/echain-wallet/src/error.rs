//! Wallet error types.

use echain_core::error::{AddressError, CryptoError, NetworkError, TransactionError};
use thiserror::Error;

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// The spendable outputs do not cover the amount.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Spendable value found.
        have: u64,
        /// Amount requested.
        need: u64,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid secret key: {0}")]
    InvalidSecret(String),

    /// No node answered a request in time.
    #[error("no node replied")]
    NoResponse,

    /// A broadcast reached none of its targets.
    #[error("{command} was not delivered to any node")]
    Undelivered { command: &'static str },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_insufficient_funds() {
        let e = WalletError::InsufficientFunds { have: 100, need: 200 };
        assert_eq!(e.to_string(), "insufficient funds: have 100, need 200");
    }

    #[test]
    fn display_undelivered() {
        let e = WalletError::Undelivered { command: "newtxn" };
        assert_eq!(e.to_string(), "newtxn was not delivered to any node");
    }

    #[test]
    fn from_crypto_error() {
        let wallet: WalletError = CryptoError::InvalidSecretKey.into();
        assert_eq!(wallet, WalletError::Crypto(CryptoError::InvalidSecretKey));
    }
}
