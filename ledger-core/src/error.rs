//! Error types for the ledger core.

use thiserror::Error;

use crate::types::BlockHash;
use crate::utxo::UtxoKey;

/// Main error type for the ledger core.
#[derive(Debug, Error)]
pub enum LedgerCoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("UTXO error: {0}")]
    Utxo(#[from] UtxoError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),

    #[error("Log rotation failed: {0}")]
    RotationFailed(String),
}

/// Storage-related errors.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised while interpreting transaction data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("Public key is malformed: expected at least {expected} bytes, got {actual}")]
    InvalidPubKey { expected: usize, actual: usize },

    #[error("Invalid public key hash version")]
    InvalidPubKeyHashVersion,
}

/// Errors surfaced by the UTXO index.
#[derive(Debug, Error)]
pub enum UtxoError {
    #[error("UTXO {0} not found")]
    UtxoNotFound(UtxoKey),

    #[error("Transaction input refers to a transaction without a journal: {0}")]
    TxInputInvalid(String),

    #[error("Output {index} not found in journal of transaction {txid}")]
    VoutNotFound { txid: String, index: u32 },

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors raised by the ledger and the fork resolution flow.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Block {hash} at height {height} does not extend the tail")]
    PrevHashMismatch { hash: BlockHash, height: u64 },

    #[error("Block {0} not found")]
    BlockNotFound(BlockHash),

    #[error("Transaction verification failed for block {0}")]
    TransactionVerificationFailed(BlockHash),

    #[error("Not enough distinct producers behind block {0}")]
    ProducerInsufficient(BlockHash),

    #[error("Ledger is not ready: {0}")]
    NotReady(String),

    #[error("Invalid block {hash}: {reason}")]
    InvalidBlock { hash: BlockHash, reason: String },

    #[error("Ledger has no tail block; create it from a genesis block first")]
    NotInitialized,

    #[error("Chain state is corrupted: {0}")]
    CorruptedChain(String),

    #[error(
        "Fork merge failed ({cause}) and restoring the original chain also failed ({restore_error}); \
         ledger may be on neither fork"
    )]
    RestoreFailed {
        cause: Box<ChainError>,
        restore_error: Box<ChainError>,
    },

    #[error("UTXO error: {0}")]
    Utxo(#[from] UtxoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ChainError {
    /// Returns a short category string for logging.
    pub fn category(&self) -> &'static str {
        match self {
            ChainError::PrevHashMismatch { .. } => "prev_hash",
            ChainError::BlockNotFound(_) => "not_found",
            ChainError::TransactionVerificationFailed(_) => "verification",
            ChainError::ProducerInsufficient(_) => "producer_policy",
            ChainError::NotReady(_) => "state",
            ChainError::InvalidBlock { .. } => "validation",
            ChainError::NotInitialized => "state",
            ChainError::CorruptedChain(_) => "corruption",
            ChainError::RestoreFailed { .. } => "restore",
            ChainError::Utxo(_) => "utxo",
            ChainError::Storage(_) => "storage",
        }
    }
}

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for UTXO index results.
pub type UtxoResult<T> = std::result::Result<T, UtxoError>;

/// Type alias for ledger and fork resolution results.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

/// Type alias for crate-level results.
pub type Result<T> = std::result::Result<T, LedgerCoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_error_categories() {
        let hash = BlockHash::zero();
        assert_eq!(
            ChainError::PrevHashMismatch {
                hash,
                height: 1
            }
            .category(),
            "prev_hash"
        );
        assert_eq!(ChainError::BlockNotFound(hash).category(), "not_found");
        assert_eq!(ChainError::NotInitialized.category(), "state");
        assert_eq!(ChainError::Storage(StorageError::NotFound("x".into())).category(), "storage");

        let restore = ChainError::RestoreFailed {
            cause: Box::new(ChainError::TransactionVerificationFailed(hash)),
            restore_error: Box::new(ChainError::BlockNotFound(hash)),
        };
        assert_eq!(restore.category(), "restore");
        assert!(restore.to_string().contains("neither fork"));
    }

    #[test]
    fn test_error_conversions() {
        let storage = StorageError::WriteFailed("disk full".to_string());
        let utxo: UtxoError = storage.clone().into();
        assert!(matches!(utxo, UtxoError::Storage(StorageError::WriteFailed(_))));

        let chain: ChainError = utxo.into();
        assert_eq!(chain.category(), "utxo");

        let top: LedgerCoreError = storage.into();
        assert!(top.to_string().starts_with("Storage error"));
    }
}
