//! Chain management with fork resolution
//!
//! This module provides:
//! - A pool of candidate blocks organised as a forest of forks
//! - The canonical ledger with append, rollback and LIB tracking
//! - Block and transaction verification used during replay
//! - The manager that turns incoming blocks into reorganizations

pub mod fork_pool;
pub mod ledger;
pub mod manager;
pub mod verify;

#[cfg(test)]
mod fork_pool_test;

pub use fork_pool::{DEFAULT_FORK_POOL_CAPACITY, ForkPool};
pub use ledger::{BlockContext, Ledger, LedgerIter, LedgerState, StateTransition};
pub use manager::{ChainManager, DownloadRequest, PushOutcome, ReorgEvent};
pub use verify::{verify_block_hash, verify_transactions};
