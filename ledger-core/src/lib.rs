//! Ledger core of a multi-producer UTXO blockchain node.
//!
//! This library provides:
//!
//! - A fork pool caching candidate blocks as a forest of forks
//! - A staged UTXO index that can apply, commit and undo a block's effects
//! - The canonical ledger with append, rollback and last-irreversible-block tracking
//! - A chain manager that merges longer forks and restores the chain when a merge fails
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ledger_core::chain::{ChainManager, Ledger};
//! use ledger_core::interface::{Consensus, Mempool, PeerService};
//! use ledger_core::types::Block;
//! use ledger_core::{LedgerConfig, init_logging};
//!
//! fn start(
//!     mempool: Arc<dyn Mempool>,
//!     consensus: Arc<dyn Consensus>,
//!     peers: Arc<dyn PeerService>,
//! ) -> Result<ChainManager, Box<dyn std::error::Error>> {
//!     let config = LedgerConfig::new("./.tmp/ledger");
//!     config.validate()?;
//!     let _logging = init_logging(config.logging.clone())?;
//!
//!     let storage = config.open_storage()?;
//!     let ledger = match Ledger::open(storage.clone(), mempool.clone(), None, &config) {
//!         Ok(ledger) => ledger,
//!         Err(_) => Ledger::create(Block::new_genesis(vec![], "genesis"), storage, mempool, None, &config)?,
//!     };
//!     Ok(ChainManager::new(Arc::new(ledger), consensus, peers, &config))
//! }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod chain;
pub mod config;
pub mod contract;
pub mod error;
pub mod interface;
pub mod logging;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod utxo;

// Re-export main types for convenience
pub use chain::{ChainManager, ForkPool, Ledger, LedgerState, PushOutcome, ReorgEvent};
pub use config::LedgerConfig;
pub use error::{
    ChainError, ChainResult, LedgerCoreError, LoggingError, LoggingResult, StorageError,
    TransactionError, UtxoError,
};
pub use logging::{LogFileConfig, LoggingConfig, LoggingGuard, init_console_logging, init_logging};
pub use tracing::level_filters::LevelFilter;
pub use types::{Block, BlockHash, Txid};
pub use utxo::{UtxoIndex, UtxoSet};

/// Current version of the ledger-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
