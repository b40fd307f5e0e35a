//! Fork resolution.
//!
//! [`ChainManager`] receives blocks from peers, caches them in the
//! [`ForkPool`] and merges a fork into the [`Ledger`] once it is longer than
//! the canonical chain. A failed merge restores the chain it started from.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::fork_pool::ForkPool;
use super::ledger::{BlockContext, Ledger, LedgerState};
use super::verify::{verify_block_hash, verify_transactions};
use crate::config::LedgerConfig;
use crate::contract::ContractState;
use crate::error::{ChainError, ChainResult};
use crate::interface::{Consensus, PeerId, PeerService};
use crate::types::{Block, BlockHash};
use crate::utxo::UtxoIndex;

/// Event emitted when a fork has been merged into the ledger.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    /// Last block shared by the old and the new chain
    pub common_ancestor: BlockHash,
    /// Height of the common ancestor
    pub common_height: u64,
    /// Blocks removed from the chain, in ascending height
    pub disconnected: Vec<Block>,
    /// Blocks added to the chain, in ascending height
    pub connected: Vec<Block>,
}

impl ReorgEvent {
    /// Whether the merge only extended the tail.
    pub fn is_extension(&self) -> bool {
        self.disconnected.is_empty()
    }
}

/// What [`ChainManager::push`] did with a block.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// Kept in the fork pool without touching the ledger.
    Cached,
    /// The fork's parent is unknown and was requested from the sender.
    ParentRequested(BlockHash),
    /// The block is too far ahead; a bulk download was requested instead.
    DownloadRequested,
    Merged(ReorgEvent),
}

/// A bulk download request.
///
/// The downloader calls [`DownloadRequest::finish`] when done. Dropping the
/// request counts as finishing it.
#[derive(Debug)]
pub struct DownloadRequest {
    finished: oneshot::Sender<()>,
}

impl DownloadRequest {
    pub fn finish(self) {
        let _ = self.finished.send(());
    }
}

pub struct ChainManager {
    ledger: Arc<Ledger>,
    pool: ForkPool,
    consensus: Arc<dyn Consensus>,
    peers: Arc<dyn PeerService>,
    height_diff_threshold: u64,
    download_tx: mpsc::Sender<DownloadRequest>,
    download_rx: Mutex<Option<mpsc::Receiver<DownloadRequest>>>,
}

impl ChainManager {
    pub fn new(
        ledger: Arc<Ledger>,
        consensus: Arc<dyn Consensus>,
        peers: Arc<dyn PeerService>,
        config: &LedgerConfig,
    ) -> Self {
        let (download_tx, download_rx) = mpsc::channel(config.download_request_capacity.max(1));
        Self {
            ledger,
            pool: ForkPool::new(config.fork_pool_capacity),
            consensus,
            peers,
            height_diff_threshold: config.height_diff_threshold,
            download_tx,
            download_rx: Mutex::new(Some(download_rx)),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn fork_pool(&self) -> &ForkPool {
        &self.pool
    }

    /// Hands out the receiving end of the download request channel. Only the
    /// first call returns it.
    pub fn take_download_requests(&self) -> Option<mpsc::Receiver<DownloadRequest>> {
        self.download_rx.lock().take()
    }

    /// Hash and consensus checks on a received block.
    pub fn verify_block(&self, block: &Block) -> bool {
        if !verify_block_hash(block) {
            return false;
        }
        if !self.consensus.validate(block) {
            warn!("Block {} at height {} rejected by consensus", block.hash(), block.height());
            return false;
        }
        debug!("Block {} passed consensus validation", block.hash());
        true
    }

    /// Processes a block received from `peer`.
    pub fn push(&self, block: Block, peer: &PeerId) -> ChainResult<PushOutcome> {
        info!("Received block {} at height {} from {}", block.hash(), block.height(), peer);

        let state = self.ledger.state();
        if state != LedgerState::Ready {
            info!("Ledger not ready, discarding block {}: state is {}", block.hash(), state);
            return Err(ChainError::NotReady(state.to_string()));
        }
        if !self.verify_block(&block) {
            return Err(ChainError::InvalidBlock {
                hash: block.hash(),
                reason: "hash or consensus check failed".to_string(),
            });
        }

        let received = block.height();
        let own = self.ledger.max_height();
        if received > own && received - own >= self.height_diff_threshold {
            warn!(
                "Received block at height {} while the tail is at {}, requesting a download",
                received, own
            );
            self.request_download_blockchain();
            return Ok(PushOutcome::DownloadRequested);
        }

        self.pool.add_block(&block);
        let Some(head) = self.pool.get_fork_head(&block) else {
            return Ok(PushOutcome::Cached);
        };

        if !self.ledger.is_in_blockchain(&head.hash()) && !self.ledger.is_in_blockchain(&head.prev_hash()) {
            info!("Parent {} of fork head {} is unknown, requesting it from {}", head.prev_hash(), head.hash(), peer);
            self.request_block(head.prev_hash(), peer);
            return Ok(PushOutcome::ParentRequested(head.prev_hash()));
        }

        let fork = self.pool.get_fork(&head.hash());
        match fork.first() {
            None => return Ok(PushOutcome::Cached),
            Some(leaf) if leaf.height() <= self.ledger.max_height() => {
                debug!("Fork ending at height {} is not longer than the chain", leaf.height());
                return Ok(PushOutcome::Cached);
            }
            Some(_) => {}
        }

        let Some(_transition) = self.ledger.begin_transition(LedgerState::Syncing) else {
            return Err(ChainError::NotReady(self.ledger.state().to_string()));
        };
        info!("Merging fork of {} blocks headed by {}", fork.len(), head.hash());

        let result = self.merge_fork(&fork);
        self.pool.remove_fork(&fork);
        match result {
            Ok(event) => Ok(PushOutcome::Merged(event)),
            Err(e) => {
                warn!("Merging fork headed by {} failed ({}): {}", head.hash(), e.category(), e);
                Err(e)
            }
        }
    }

    /// Replaces the chain above the fork's join point with `fork`, which is
    /// ordered leaf first.
    ///
    /// If any fork block is rejected the original chain is restored and the
    /// rejection is returned. If the restore fails too, the ledger is left
    /// wherever the restore stopped and [`ChainError::RestoreFailed`] is
    /// returned.
    pub fn merge_fork(&self, fork: &[Block]) -> ChainResult<ReorgEvent> {
        let fork = self.purify_fork(fork);
        let Some(first) = fork.last() else {
            let tail = self.ledger.tail_block();
            return Ok(ReorgEvent {
                common_ancestor: tail.hash(),
                common_height: tail.height(),
                disconnected: Vec::new(),
                connected: Vec::new(),
            });
        };

        let join = first.prev_hash();
        let join_block = self.ledger.get_block_by_hash(&join)?;
        let disconnected = self.blocks_above(&join)?;
        let original_states = self.contract_states_after(&disconnected)?;

        let (index, state) = self.revert_utxo_and_sc_state_at_block_hash(&join).map_err(|e| {
            error!("Cannot revert to {}, the chain is corrupted: {}", join, e);
            ChainError::CorruptedChain(format!("revert to {} failed: {}", join, e))
        })?;
        self.ledger.rollback(&index, &join, &state)?;

        let connected: Vec<Block> = fork.iter().rev().cloned().collect();
        for block in &connected {
            if let Err(cause) = self.replay_block(block) {
                return Err(self.restore(&join, &disconnected, &original_states, cause));
            }
        }

        info!(
            "Merged fork at height {}: {} blocks disconnected, {} connected, new tail {}",
            join_block.height(),
            disconnected.len(),
            connected.len(),
            self.ledger.tail_hash()
        );
        Ok(ReorgEvent {
            common_ancestor: join,
            common_height: join_block.height(),
            disconnected,
            connected,
        })
    }

    /// Drops the blocks at the root end of `fork` that are already on the
    /// chain.
    fn purify_fork<'a>(&self, fork: &'a [Block]) -> &'a [Block] {
        let mut end = fork.len();
        while end > 0 && self.ledger.is_in_blockchain(&fork[end - 1].hash()) {
            end -= 1;
        }
        if end < fork.len() {
            debug!("Dropped {} fork blocks already on the chain", fork.len() - end);
        }
        &fork[..end]
    }

    /// Canonical blocks above `hash`, ascending.
    fn blocks_above(&self, hash: &BlockHash) -> ChainResult<Vec<Block>> {
        let mut blocks = Vec::new();
        for block in self.ledger.iter() {
            let block = block?;
            if block.hash() == *hash {
                blocks.reverse();
                return Ok(blocks);
            }
            blocks.push(block);
        }
        Err(ChainError::BlockNotFound(*hash))
    }

    /// Contract state right after each of `blocks`, which must be the
    /// canonical blocks ending at the tail, ascending.
    fn contract_states_after(&self, blocks: &[Block]) -> ChainResult<Vec<ContractState>> {
        let storage = self.ledger.storage();
        let mut state = self.ledger.contract_state()?;
        let mut states = Vec::with_capacity(blocks.len());
        for block in blocks.iter().rev() {
            states.push(state.clone());
            state.revert_state(storage.as_ref(), &block.hash())?;
        }
        states.reverse();
        Ok(states)
    }

    fn replay_block(&self, block: &Block) -> ChainResult<()> {
        if !self.ledger.check_lib_policy(block) {
            warn!("Block {} does not have enough distinct producers behind it", block.hash());
            return Err(ChainError::ProducerInsufficient(block.hash()));
        }

        info!("Verifying fork block {} at height {}", block.hash(), block.height());
        let index = self.ledger.utxo_index();
        if !verify_transactions(block, &index) {
            return Err(ChainError::TransactionVerificationFailed(block.hash()));
        }

        // contract execution happens outside the core; the state is carried over
        let state = self.ledger.contract_state()?;
        self.ledger.add_block_context_to_tail(&BlockContext::new(block.clone(), index, state))
    }

    /// Puts `originals` back on top of `join` after a failed replay and
    /// returns the error to report.
    fn restore(
        &self,
        join: &BlockHash,
        originals: &[Block],
        original_states: &[ContractState],
        cause: ChainError,
    ) -> ChainError {
        warn!("Fork replay failed ({}), restoring {} original blocks", cause, originals.len());

        match self.reappend(join, originals, original_states) {
            Ok(()) => {
                if matches!(cause, ChainError::ProducerInsufficient(_)) {
                    self.broadcast_block(&self.ledger.tail_block());
                }
                cause
            }
            Err(restore_error) => {
                error!(
                    "Failed to restore the chain after a failed merge: {} (merge error: {}). \
                     The ledger is at height {} and needs a resync",
                    restore_error,
                    cause,
                    self.ledger.max_height()
                );
                ChainError::RestoreFailed {
                    cause: Box::new(cause),
                    restore_error: Box::new(restore_error),
                }
            }
        }
    }

    /// Appends `originals` back on top of `join`, each with the contract
    /// state it had before, so every block gets its own changelog again.
    fn reappend(&self, join: &BlockHash, originals: &[Block], states: &[ContractState]) -> ChainResult<()> {
        let (index, state) = self.revert_utxo_and_sc_state_at_block_hash(join)?;
        self.ledger.rollback(&index, join, &state)?;

        for (block, state) in originals.iter().zip(states) {
            let index = self.ledger.utxo_index();
            if !verify_transactions(block, &index) {
                return Err(ChainError::TransactionVerificationFailed(block.hash()));
            }
            self.ledger.add_block_context_to_tail(&BlockContext::new(block.clone(), index, state.clone()))?;
        }
        Ok(())
    }

    /// Computes the UTXO index and contract state the chain had when `hash`
    /// was the tail, and commits the index.
    pub fn revert_utxo_and_sc_state_at_block_hash(
        &self,
        hash: &BlockHash,
    ) -> ChainResult<(UtxoIndex, ContractState)> {
        let storage = self.ledger.storage();
        let index = self.ledger.utxo_index();
        let mut state = self.ledger.contract_state()?;

        let mut found = false;
        for block in self.ledger.iter() {
            let block = block?;
            if block.hash() == *hash {
                found = true;
                break;
            }
            if let Err(e) = index.undo_txs_in_block(&block) {
                warn!("Failed to undo the UTXO changes of block {}: {}", block.hash(), e);
                return Err(e.into());
            }
            if let Err(e) = state.revert_state(storage.as_ref(), &block.hash()) {
                warn!("Failed to revert the contract state of block {}: {}", block.hash(), e);
                return Err(e.into());
            }
        }
        if !found {
            return Err(ChainError::BlockNotFound(*hash));
        }

        index.save()?;
        Ok((index, state))
    }

    /// Asks the downloader for a bulk download on a background thread.
    ///
    /// The ledger is `Downloading` until the request is finished or dropped.
    /// When the request queue is full the request is discarded.
    pub fn request_download_blockchain(&self) -> Option<JoinHandle<()>> {
        let ledger = Arc::clone(&self.ledger);
        let requests = self.download_tx.clone();

        let spawned = thread::Builder::new().name("ledger-download".to_string()).spawn(move || {
            ledger.set_state(LedgerState::Downloading);

            let (finished, done) = oneshot::channel();
            if let Err(e) = requests.try_send(DownloadRequest {
                finished,
            }) {
                warn!("Download request dropped: {}", e);
                ledger.set_state(LedgerState::Ready);
                return;
            }

            if done.blocking_recv().is_err() {
                debug!("Download request dropped before completion");
            }
            ledger.set_state(LedgerState::Ready);
            info!("Download finished at height {}", ledger.max_height());
        });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to spawn download thread: {}", e);
                None
            }
        }
    }

    /// Re-roots the fork pool at the ledger tail. Used after a bulk download.
    pub fn reset_pool_root(&self) {
        self.pool.set_root_block(&self.ledger.tail_block());
    }

    pub fn request_block(&self, hash: BlockHash, peer: &PeerId) {
        debug!("Requesting block {} from {}", hash, peer);
        self.peers.request_block(hash, peer);
    }

    pub fn broadcast_block(&self, block: &Block) {
        debug!("Broadcasting block {} at height {}", block.hash(), block.height());
        self.peers.broadcast_block(block);
    }

    /// Answers a peer asking for a stored block.
    pub fn handle_block_request(&self, hash: &BlockHash, peer: &PeerId) {
        match self.ledger.get_block_by_hash(hash) {
            Ok(block) => self.peers.send_block(&block, peer),
            Err(e) => warn!("Cannot serve block {} to {}: {}", hash, peer, e),
        }
    }

    /// Number of cached forks rooted in the chain and the length of the
    /// longest one.
    pub fn num_forks(&self) -> (u64, u64) {
        self.pool.num_forks(|hash| self.ledger.get_block_by_hash(hash).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::test_utils::{MockConsensus, MockMempool, MockPeers};

    fn setup(threshold: u64) -> (Arc<MockConsensus>, Arc<MockPeers>, ChainManager) {
        let storage = Arc::new(MemoryStorage::new());
        let config = LedgerConfig::default().with_height_diff_threshold(threshold);
        let ledger = Ledger::create(
            Block::new_genesis(vec![], "genesis"),
            storage,
            Arc::new(MockMempool::new()),
            None,
            &config,
        )
        .unwrap();
        let consensus = Arc::new(MockConsensus::new());
        let peers = Arc::new(MockPeers::new());
        let manager = ChainManager::new(Arc::new(ledger), consensus.clone(), peers.clone(), &config);
        (consensus, peers, manager)
    }

    fn chain_on(parent: &Block, len: usize, producer: &str) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::new();
        for _ in 0..len {
            let prev = blocks.last().unwrap_or(parent);
            blocks.push(Block::new(vec![], Some(prev), producer));
        }
        blocks
    }

    #[test]
    fn test_push_extends_tail() {
        let (_, _, manager) = setup(10);
        let peer = PeerId::new("peer");
        let block = Block::new(vec![], Some(&manager.ledger().tail_block()), "p1");

        let outcome = manager.push(block.clone(), &peer).unwrap();
        assert_matches!(outcome, PushOutcome::Merged(event) if event.is_extension() && event.connected == vec![block.clone()]);
        assert_eq!(manager.ledger().tail_hash(), block.hash());
        assert!(manager.fork_pool().is_empty());
        assert_eq!(manager.ledger().state(), LedgerState::Ready);
    }

    #[test]
    fn test_push_rejects_invalid_block() {
        let (consensus, _, manager) = setup(10);
        consensus.set_accept(false);
        let block = Block::new(vec![], Some(&manager.ledger().tail_block()), "p1");
        assert_matches!(manager.push(block, &PeerId::new("peer")), Err(ChainError::InvalidBlock { .. }));

        consensus.set_accept(true);
        let forged = Block::new(vec![], Some(&manager.ledger().tail_block()), "p1")
            .with_hash(BlockHash::hash_of(b"forged"));
        assert_matches!(manager.push(forged, &PeerId::new("peer")), Err(ChainError::InvalidBlock { .. }));
        assert_eq!(manager.ledger().max_height(), 0);
    }

    #[test]
    fn test_push_when_not_ready() {
        let (_, _, manager) = setup(10);
        manager.ledger().set_state(LedgerState::Produce);
        let block = Block::new(vec![], Some(&manager.ledger().tail_block()), "p1");
        assert_matches!(manager.push(block, &PeerId::new("peer")), Err(ChainError::NotReady(_)));
        assert!(manager.fork_pool().is_empty());
    }

    #[test]
    fn test_push_requests_unknown_parent() {
        let (_, peers, manager) = setup(10);
        let genesis = manager.ledger().tail_block();
        let blocks = chain_on(&genesis, 3, "p1");
        let peer = PeerId::new("peer");

        let outcome = manager.push(blocks[2].clone(), &peer).unwrap();
        assert_matches!(outcome, PushOutcome::ParentRequested(h) if h == blocks[1].hash());
        assert_eq!(peers.requested(), vec![(blocks[1].hash(), peer.clone())]);

        assert_matches!(
            manager.push(blocks[1].clone(), &peer).unwrap(),
            PushOutcome::ParentRequested(h) if h == blocks[0].hash()
        );
        let outcome = manager.push(blocks[0].clone(), &peer).unwrap();
        assert_matches!(outcome, PushOutcome::Merged(event) if event.connected.len() == 3);
        assert_eq!(manager.ledger().tail_hash(), blocks[2].hash());
    }

    #[test]
    fn test_shorter_fork_is_cached() {
        let (_, _, manager) = setup(10);
        let genesis = manager.ledger().tail_block();
        let peer = PeerId::new("peer");
        for block in chain_on(&genesis, 2, "p1") {
            manager.push(block, &peer).unwrap();
        }

        let rival = Block::new(vec![], Some(&genesis), "p2");
        assert_matches!(manager.push(rival.clone(), &peer).unwrap(), PushOutcome::Cached);
        assert!(manager.fork_pool().contains(&rival.hash()));
        assert_eq!(manager.ledger().max_height(), 2);
    }

    #[test]
    fn test_far_ahead_block_requests_download() {
        let (_, _, manager) = setup(3);
        let mut requests = manager.take_download_requests().unwrap();
        assert!(manager.take_download_requests().is_none());

        let blocks = chain_on(&manager.ledger().tail_block(), 3, "p1");
        let outcome = manager.push(blocks[2].clone(), &PeerId::new("peer")).unwrap();
        assert_matches!(outcome, PushOutcome::DownloadRequested);

        let request = requests.blocking_recv().unwrap();
        assert_eq!(manager.ledger().state(), LedgerState::Downloading);
        request.finish();
        while manager.ledger().state() != LedgerState::Ready {
            thread::yield_now();
        }
    }

    #[test]
    fn test_download_request_dropped_when_queue_full() {
        let storage = Arc::new(MemoryStorage::new());
        let config = LedgerConfig::default().with_download_request_capacity(1);
        let ledger = Ledger::create(
            Block::new_genesis(vec![], "genesis"),
            storage,
            Arc::new(MockMempool::new()),
            None,
            &config,
        )
        .unwrap();
        let manager = ChainManager::new(
            Arc::new(ledger),
            Arc::new(MockConsensus::new()),
            Arc::new(MockPeers::new()),
            &config,
        );
        let mut requests = manager.take_download_requests().unwrap();

        let first = manager.request_download_blockchain().unwrap();
        while manager.download_tx.capacity() > 0 {
            thread::yield_now();
        }

        // the queue is full: the second request is dropped and the state reset
        let second = manager.request_download_blockchain().unwrap();
        second.join().unwrap();
        assert_eq!(manager.ledger().state(), LedgerState::Ready);

        requests.blocking_recv().unwrap().finish();
        first.join().unwrap();
        assert_eq!(manager.ledger().state(), LedgerState::Ready);
    }

    #[test]
    fn test_revert_to_unknown_hash() {
        let (_, _, manager) = setup(10);
        for block in chain_on(&manager.ledger().tail_block(), 2, "p1") {
            manager.push(block, &PeerId::new("peer")).unwrap();
        }
        let unknown = BlockHash::hash_of(b"unknown");
        assert_matches!(
            manager.revert_utxo_and_sc_state_at_block_hash(&unknown),
            Err(ChainError::BlockNotFound(h)) if h == unknown
        );
    }

    #[test]
    fn test_handle_block_request() {
        let (_, peers, manager) = setup(10);
        let peer = PeerId::new("asker");
        let genesis = manager.ledger().tail_block();
        manager.handle_block_request(&genesis.hash(), &peer);
        manager.handle_block_request(&BlockHash::hash_of(b"missing"), &peer);
        assert_eq!(peers.sent(), vec![(genesis.hash(), peer)]);
    }

    #[test]
    fn test_num_forks_counts_rooted_forks() {
        let (_, _, manager) = setup(10);
        let genesis = manager.ledger().tail_block();
        let peer = PeerId::new("peer");
        let main = chain_on(&genesis, 3, "p1");
        for block in &main {
            manager.push(block.clone(), &peer).unwrap();
        }

        let rival = chain_on(&genesis, 2, "p2");
        for block in &rival {
            manager.push(block.clone(), &peer).unwrap();
        }
        let detached = chain_on(&Block::new(vec![], None, "p3"), 1, "p3");
        manager.fork_pool().add_block(&detached[0]);

        assert_eq!(manager.num_forks(), (1, 2));
    }

    #[test]
    fn test_reset_pool_root() {
        let (_, _, manager) = setup(10);
        manager.reset_pool_root();
        assert_eq!(manager.fork_pool().root_hash(), Some(manager.ledger().tail_hash()));
    }
}
