//! Collaborator mocks that record how they were called.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::interface::{Consensus, LibPolicy, Mempool, PeerId, PeerService};
use crate::transaction::Transaction;
use crate::types::{Block, BlockHash};

#[derive(Default)]
pub struct MockMempool {
    pushed: Mutex<Vec<Transaction>>,
    rolled_back: Mutex<Vec<Transaction>>,
    cleaned: Mutex<Vec<Transaction>>,
}

impl MockMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushed(&self) -> Vec<Transaction> {
        self.pushed.lock().clone()
    }

    pub fn rolled_back(&self) -> Vec<Transaction> {
        self.rolled_back.lock().clone()
    }

    /// Every transaction reported as mined, in order.
    pub fn cleaned(&self) -> Vec<Transaction> {
        self.cleaned.lock().clone()
    }
}

impl Mempool for MockMempool {
    fn push(&self, tx: Transaction) {
        self.pushed.lock().push(tx);
    }

    fn rollback(&self, tx: Transaction) {
        self.rolled_back.lock().push(tx);
    }

    fn clean_up_mined_txs(&self, txs: &[Transaction]) {
        self.cleaned.lock().extend_from_slice(txs);
    }
}

/// Accepts every block until told otherwise.
pub struct MockConsensus {
    accept: AtomicBool,
}

impl MockConsensus {
    pub fn new() -> Self {
        Self {
            accept: AtomicBool::new(true),
        }
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }
}

impl Default for MockConsensus {
    fn default() -> Self {
        Self::new()
    }
}

impl Consensus for MockConsensus {
    fn validate(&self, _block: &Block) -> bool {
        self.accept.load(Ordering::SeqCst)
    }
}

pub struct MockLibPolicy {
    min_confirmations: u64,
    total_producers: u64,
    bypass: bool,
}

impl MockLibPolicy {
    pub fn new(min_confirmations: u64, total_producers: u64, bypass: bool) -> Self {
        Self {
            min_confirmations,
            total_producers,
            bypass,
        }
    }
}

impl LibPolicy for MockLibPolicy {
    fn min_confirmation_num(&self) -> u64 {
        self.min_confirmations
    }

    fn is_bypassing_lib_check(&self) -> bool {
        self.bypass
    }

    fn total_producers_num(&self) -> u64 {
        self.total_producers
    }
}

#[derive(Default)]
pub struct MockPeers {
    requested: Mutex<Vec<(BlockHash, PeerId)>>,
    sent: Mutex<Vec<(BlockHash, PeerId)>>,
    broadcast: Mutex<Vec<BlockHash>>,
}

impl MockPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Vec<(BlockHash, PeerId)> {
        self.requested.lock().clone()
    }

    pub fn sent(&self) -> Vec<(BlockHash, PeerId)> {
        self.sent.lock().clone()
    }

    pub fn broadcast(&self) -> Vec<BlockHash> {
        self.broadcast.lock().clone()
    }
}

impl PeerService for MockPeers {
    fn request_block(&self, hash: BlockHash, peer: &PeerId) {
        self.requested.lock().push((hash, peer.clone()));
    }

    fn send_block(&self, block: &Block, peer: &PeerId) {
        self.sent.lock().push((block.hash(), peer.clone()));
    }

    fn broadcast_block(&self, block: &Block) {
        self.broadcast.lock().push(block.hash());
    }
}
