//! Error types for EChain.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("dangling reference: {0} is not an unspent output")] DanglingReference(String),
    #[error("pubkey on input {index} does not match the locking script")] InvalidKey { index: usize },
    #[error("invalid signature on input {index}")] InvalidSignature { index: usize },
    #[error("overspend: inputs {inputs} < outputs {outputs}")] Overspend { inputs: u64, outputs: u64 },
    #[error("duplicate input: {0}")] DuplicateInput(String),
    #[error("stored hash {stored} does not match computed {computed}")] HashMismatch { stored: String, computed: String },
    #[error("no outputs")] NoOutputs,
    #[error("value overflow")] ValueOverflow,
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block hash does not meet the target")] InvalidPoW,
    #[error("block has no transactions")] NoTransactions,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("invalid reward: got {got}, max {max}")] InvalidReward { got: u64, max: u64 },
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("transaction {0} hash does not match its contents")] TxHashMismatch(usize),
    #[error("prev hash {got} does not extend tip {expected}")] PrevHashMismatch { expected: String, got: String },
    #[error("duplicate block: {0}")] DuplicateBlock(String),
    #[error("tx error in {index}: {source}")] Transaction { index: usize, source: TransactionError },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid secret key bytes")] InvalidSecretKey,
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58: {0}")] InvalidBase58(String),
    #[error("invalid length: {0}")] InvalidLength(usize),
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid version: {0}")] InvalidVersion(u8),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("connect to {addr}: {reason}")] Connect { addr: String, reason: String },
    #[error("io: {0}")] Io(String),
    #[error("timeout")] Timeout,
    #[error("message too large: {size}")] MessageTooLarge { size: usize },
    #[error("unknown command: {0}")] UnknownCommand(String),
    #[error("malformed {command}: {reason}")] Malformed { command: String, reason: String },
    #[error("unexpected reply: {0}")] UnexpectedReply(String),
    #[error("timed out waiting for header {0}")] SyncTimeout(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("conflicts with pool tx {existing_txid} on outpoint {outpoint}")] Conflict { new_txid: String, existing_txid: String, outpoint: String },
    #[error("pool full")] PoolFull,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainStateError {
    #[error("empty chain: no tip stored")] EmptyChain,
    #[error("block not found: {0}")] BlockNotFound(String),
}

#[derive(Error, Debug)]
pub enum EchainError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Network(#[from] NetworkError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] ChainState(#[from] ChainStateError),
    #[error("storage: {0}")] Storage(String),
    #[error("config: {0}")] Config(String),
    #[error("background task failed: {0}")] Task(String),
}

impl EchainError {
    /// Whether this error is a rejection of untrusted input rather than a local failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Transaction(_) | Self::Block(_) | Self::Crypto(_) | Self::Mempool(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_error_wraps_transparently() {
        let err: EchainError = TransactionError::InvalidKey { index: 2 }.into();
        assert_eq!(err.to_string(), "pubkey on input 2 does not match the locking script");
        assert!(err.is_validation());
    }

    #[test]
    fn storage_error_is_not_validation() {
        let err = EchainError::Storage("disk full".into());
        assert!(!err.is_validation());
        assert_eq!(err.to_string(), "storage: disk full");
    }

    #[test]
    fn block_error_carries_source() {
        let err = BlockError::Transaction {
            index: 1,
            source: TransactionError::Overspend { inputs: 5, outputs: 9 },
        };
        assert_eq!(err.to_string(), "tx error in 1: overspend: inputs 5 < outputs 9");
    }
}
