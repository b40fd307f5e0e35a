//! Collaborators the ledger core consumes but does not own.
//!
//! Implementations are injected at construction as `Arc<dyn Trait>`.

use std::fmt;

use crate::transaction::Transaction;
use crate::types::{Block, BlockHash};

/// Opaque consensus acceptance check (producer schedule, signatures).
pub trait Consensus: Send + Sync {
    fn validate(&self, block: &Block) -> bool;
}

/// Finality policy.
pub trait LibPolicy: Send + Sync {
    /// Depth below the tail at which a block becomes irreversible. Also the
    /// minimum number of distinct recent producers a new block needs.
    fn min_confirmation_num(&self) -> u64;

    /// Skips the producer check, for single-producer and test topologies.
    fn is_bypassing_lib_check(&self) -> bool;

    /// Number of producers in the schedule.
    fn total_producers_num(&self) -> u64;
}

/// Transaction pool.
pub trait Mempool: Send + Sync {
    fn push(&self, tx: Transaction);

    /// Returns a transaction from an unwound block to the pool.
    fn rollback(&self, tx: Transaction);

    /// Drops transactions that were mined in a block and re-queues their
    /// still-pending children.
    fn clean_up_mined_txs(&self, txs: &[Transaction]);
}

/// Identifier of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network operations the fork resolution flow needs.
pub trait PeerService: Send + Sync {
    /// Asks `peer` for the block with `hash`.
    fn request_block(&self, hash: BlockHash, peer: &PeerId);

    fn send_block(&self, block: &Block, peer: &PeerId);

    fn broadcast_block(&self, block: &Block);
}
