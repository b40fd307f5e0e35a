//! The canonical chain.
//!
//! The ledger owns the tail and last-irreversible-block (LIB) pointers and is
//! the only place they change: [`Ledger::add_block_context_to_tail`] moves the
//! tail forward one block, [`Ledger::rollback`] rewinds it to an ancestor.
//! Both run under the ledger-wide update lock, which is also held for the
//! whole of a [`StateTransition`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::contract::ContractState;
use crate::error::{ChainError, ChainResult, StorageError};
use crate::interface::{LibPolicy, Mempool};
use crate::storage::{self, Storage, WriteBatch, keys};
use crate::transaction::TxJournal;
use crate::types::{Block, BlockHash};
use crate::utxo::{UtxoIndex, UtxoStore};

/// Lifecycle state of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerState {
    Init,
    /// A bulk download is in progress; incoming blocks are dropped.
    Downloading,
    /// A fork is being merged.
    Syncing,
    /// The local producer is building a block.
    Produce,
    Ready,
}

impl fmt::Display for LedgerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LedgerState::Init => "Init",
            LedgerState::Downloading => "Downloading",
            LedgerState::Syncing => "Syncing",
            LedgerState::Produce => "Produce",
            LedgerState::Ready => "Ready",
        };
        f.write_str(name)
    }
}

/// A block together with the UTXO index and contract state that result from
/// applying it.
pub struct BlockContext {
    pub block: Block,
    pub utxo_index: UtxoIndex,
    pub contract_state: ContractState,
}

impl BlockContext {
    pub fn new(block: Block, utxo_index: UtxoIndex, contract_state: ContractState) -> Self {
        Self {
            block,
            utxo_index,
            contract_state,
        }
    }
}

struct ChainPointers {
    tail: Block,
    lib: Block,
}

/// Holds the ledger in a non-ready state. Dropping it restores
/// [`LedgerState::Ready`] and releases the update lock.
pub struct StateTransition<'a> {
    ledger: &'a Ledger,
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl StateTransition<'_> {
    pub fn state(&self) -> LedgerState {
        self.ledger.state()
    }
}

impl Drop for StateTransition<'_> {
    fn drop(&mut self) {
        *self.ledger.state.write() = LedgerState::Ready;
        debug!("Ledger state restored to {}", LedgerState::Ready);
    }
}

/// Canonical chain backed by a [`Storage`].
pub struct Ledger {
    storage: Arc<dyn Storage>,
    utxo_store: Arc<UtxoStore>,
    mempool: Arc<dyn Mempool>,
    lib_policy: Option<Arc<dyn LibPolicy>>,
    pointers: RwLock<ChainPointers>,
    state: RwLock<LedgerState>,
    update_lock: ReentrantMutex<()>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger").field("state", &*self.state.read()).finish_non_exhaustive()
    }
}

impl Ledger {
    /// Starts a new chain from `genesis`, which becomes both tail and LIB.
    pub fn create(
        genesis: Block,
        storage: Arc<dyn Storage>,
        mempool: Arc<dyn Mempool>,
        lib_policy: Option<Arc<dyn LibPolicy>>,
        config: &LedgerConfig,
    ) -> ChainResult<Self> {
        let utxo_store =
            Arc::new(UtxoStore::with_capacity(Arc::clone(&storage), config.utxo_cache_capacity));
        let ledger = Self {
            storage,
            utxo_store,
            mempool,
            lib_policy,
            pointers: RwLock::new(ChainPointers {
                tail: genesis.clone(),
                lib: genesis.clone(),
            }),
            state: RwLock::new(LedgerState::Init),
            update_lock: ReentrantMutex::new(()),
        };

        let index = ledger.utxo_index();
        if !index.update_utxo_state(genesis.transactions()) {
            return Err(ChainError::TransactionVerificationFailed(genesis.hash()));
        }
        let genesis_hash = genesis.hash();
        ledger.add_block_context_to_tail(&BlockContext::new(genesis, index, ContractState::new()))?;
        ledger.set_state(LedgerState::Ready);

        info!("Created ledger with genesis {}", genesis_hash);
        Ok(ledger)
    }

    /// Reopens a chain persisted in `storage`.
    pub fn open(
        storage: Arc<dyn Storage>,
        mempool: Arc<dyn Mempool>,
        lib_policy: Option<Arc<dyn LibPolicy>>,
        config: &LedgerConfig,
    ) -> ChainResult<Self> {
        let tail_hash: BlockHash = storage::get_decoded(storage.as_ref(), keys::TAIL_BLOCK_HASH_KEY)?
            .ok_or(ChainError::NotInitialized)?;
        let tail = read_block(storage.as_ref(), &tail_hash)?;

        let lib = match storage::get_decoded::<BlockHash>(storage.as_ref(), keys::LIB_BLOCK_HASH_KEY)? {
            Some(hash) => read_block(storage.as_ref(), &hash)?,
            None => {
                let genesis_hash: BlockHash =
                    storage::get_decoded(storage.as_ref(), &keys::height_key(0))?
                        .ok_or(ChainError::NotInitialized)?;
                read_block(storage.as_ref(), &genesis_hash)?
            }
        };

        let utxo_store =
            Arc::new(UtxoStore::with_capacity(Arc::clone(&storage), config.utxo_cache_capacity));
        let ledger = Self {
            storage,
            utxo_store,
            mempool,
            lib_policy,
            pointers: RwLock::new(ChainPointers {
                tail,
                lib,
            }),
            state: RwLock::new(LedgerState::Init),
            update_lock: ReentrantMutex::new(()),
        };
        ledger.set_state(LedgerState::Ready);

        info!(
            "Opened ledger at height {} (tail {}, LIB height {})",
            ledger.max_height(),
            ledger.tail_hash(),
            ledger.lib_height()
        );
        Ok(ledger)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn state(&self) -> LedgerState {
        *self.state.read()
    }

    pub fn set_state(&self, state: LedgerState) {
        let _lock = self.update_lock.lock();
        let mut current = self.state.write();
        if *current != state {
            debug!("Ledger state {} -> {}", *current, state);
        }
        *current = state;
    }

    /// Moves a ready ledger to `to` for the lifetime of the returned guard.
    ///
    /// Returns `None` if the ledger is not ready. The update lock is held
    /// until the guard drops; the same thread may still append and roll back.
    pub fn begin_transition(&self, to: LedgerState) -> Option<StateTransition<'_>> {
        let guard = self.update_lock.lock();
        let mut state = self.state.write();
        if *state != LedgerState::Ready {
            info!("Cannot move ledger to {}: current state is {}", to, *state);
            return None;
        }
        *state = to;
        drop(state);
        debug!("Ledger state {} -> {}", LedgerState::Ready, to);

        Some(StateTransition {
            ledger: self,
            _guard: guard,
        })
    }

    pub fn tail_hash(&self) -> BlockHash {
        self.pointers.read().tail.hash()
    }

    pub fn tail_block(&self) -> Block {
        self.pointers.read().tail.clone()
    }

    /// Height of the tail block.
    pub fn max_height(&self) -> u64 {
        self.pointers.read().tail.height()
    }

    pub fn lib_hash(&self) -> BlockHash {
        self.pointers.read().lib.hash()
    }

    pub fn lib_block(&self) -> Block {
        self.pointers.read().lib.clone()
    }

    pub fn lib_height(&self) -> u64 {
        self.pointers.read().lib.height()
    }

    /// Whether a stored block sits at or below the LIB.
    pub fn is_lib(&self, block: &Block) -> bool {
        match self.get_block_by_hash(&block.hash()) {
            Ok(stored) => self.lib_height() >= stored.height(),
            Err(e) => {
                debug!("Block {} is not stored: {}", block.hash(), e);
                false
            }
        }
    }

    pub fn get_block_by_hash(&self, hash: &BlockHash) -> ChainResult<Block> {
        read_block(self.storage.as_ref(), hash)
    }

    /// Canonical block at `height`.
    pub fn get_block_by_height(&self, height: u64) -> ChainResult<Block> {
        let hash = self
            .hash_at_height(height)?
            .ok_or_else(|| StorageError::NotFound(format!("block at height {}", height)))?;
        self.get_block_by_hash(&hash)
    }

    fn hash_at_height(&self, height: u64) -> ChainResult<Option<BlockHash>> {
        // entries above the tail are left behind by rollbacks
        if height > self.max_height() {
            return Ok(None);
        }
        Ok(storage::get_decoded(self.storage.as_ref(), &keys::height_key(height))?)
    }

    /// Whether `hash` is a block of the canonical chain.
    ///
    /// Blocks that were rolled back stay in storage but are not part of the
    /// chain any more.
    pub fn is_in_blockchain(&self, hash: &BlockHash) -> bool {
        let Ok(block) = self.get_block_by_hash(hash) else {
            return false;
        };
        matches!(self.hash_at_height(block.height()), Ok(Some(canonical)) if canonical == *hash)
    }

    /// Walks the chain from the tail down to genesis.
    pub fn iter(&self) -> LedgerIter<'_> {
        LedgerIter {
            ledger: self,
            next: Some(self.tail_hash()),
        }
    }

    /// Fresh UTXO index over the committed outputs.
    pub fn utxo_index(&self) -> UtxoIndex {
        UtxoIndex::new(Arc::clone(&self.utxo_store))
    }

    /// Committed contract state.
    pub fn contract_state(&self) -> ChainResult<ContractState> {
        Ok(ContractState::load(self.storage.as_ref())?)
    }

    /// Appends `ctx.block` on top of the tail.
    ///
    /// Commits the context's UTXO index, clears the block's transactions from
    /// the mempool, then writes the block, its height entry, its transaction
    /// journals, the tail and LIB pointers and the contract state in one
    /// batch.
    pub fn add_block_context_to_tail(&self, ctx: &BlockContext) -> ChainResult<()> {
        let _lock = self.update_lock.lock();
        let block = &ctx.block;
        let hash = block.hash();

        if block.height() != 0 && block.prev_hash() != self.tail_hash() {
            warn!("Block {} at height {} does not extend the tail", hash, block.height());
            return Err(ChainError::PrevHashMismatch {
                hash,
                height: block.height(),
            });
        }

        ctx.utxo_index.save()?;
        self.mempool.clean_up_mined_txs(block.transactions());

        let new_lib = self.lib_candidate(block)?;

        let mut batch = WriteBatch::new();
        batch.put_encoded(keys::block_key(&hash), block)?;
        batch.put_encoded(keys::height_key(block.height()), &hash)?;
        for tx in block.transactions() {
            TxJournal::put(tx, &mut batch)?;
        }
        batch.put_encoded(keys::TAIL_BLOCK_HASH_KEY.to_vec(), &hash)?;
        if let Some(lib) = &new_lib {
            batch.put_encoded(keys::LIB_BLOCK_HASH_KEY.to_vec(), &lib.hash())?;
        }
        ctx.contract_state.stage_save(self.storage.as_ref(), &hash, &mut batch)?;
        self.storage.write_batch(batch)?;

        let mut pointers = self.pointers.write();
        pointers.tail = block.clone();
        if let Some(lib) = new_lib {
            pointers.lib = lib;
        }

        info!(
            "Added block {} at height {} to tail ({} txs, LIB height {})",
            hash,
            block.height(),
            block.transactions().len(),
            pointers.lib.height()
        );
        Ok(())
    }

    /// LIB after appending `block`, if it moves.
    fn lib_candidate(&self, block: &Block) -> ChainResult<Option<Block>> {
        if block.height() == 0 {
            return Ok(Some(block.clone()));
        }
        let Some(policy) = &self.lib_policy else {
            return Ok(None);
        };

        let height = block.height().saturating_sub(policy.min_confirmation_num());
        let candidate = if height == block.height() {
            block.clone()
        } else {
            self.get_block_by_height(height)?
        };

        if candidate.height() < self.lib_height() {
            debug!(
                "Keeping LIB at height {}; candidate {} is lower",
                self.lib_height(),
                candidate.height()
            );
            return Ok(None);
        }
        Ok(Some(candidate))
    }

    /// Rewinds the tail to `target`.
    ///
    /// Non-system transactions of every unwound block go back to the mempool.
    /// `index` and `state` must already describe the chain at `target`; they
    /// are committed as is. The LIB is left untouched.
    pub fn rollback(&self, index: &UtxoIndex, target: &BlockHash, state: &ContractState) -> ChainResult<()> {
        let _lock = self.update_lock.lock();

        if !self.is_in_blockchain(target) {
            warn!("Cannot roll back to {}: not in the chain", target);
            return Err(ChainError::BlockNotFound(*target));
        }
        let mut current = self.tail_block();
        if current.hash() == *target {
            return Ok(());
        }

        let mut unwound = Vec::new();
        while current.hash() != *target {
            info!("Rolling back block {} at height {}", current.hash(), current.height());
            let prev_hash = current.prev_hash();
            unwound.push(current);
            current = self.get_block_by_hash(&prev_hash)?;
        }

        for block in &unwound {
            for tx in block.transactions().iter().filter(|tx| !tx.is_system()) {
                self.mempool.rollback(tx.clone());
            }
        }

        index.save()?;
        state.persist(self.storage.as_ref())?;
        storage::put_encoded(self.storage.as_ref(), keys::TAIL_BLOCK_HASH_KEY, target)?;
        self.storage.flush()?;

        info!("Rolled back {} blocks to {} at height {}", unwound.len(), target, current.height());
        self.pointers.write().tail = current;
        Ok(())
    }

    /// Whether the finality policy lets `block` onto the chain.
    pub fn check_lib_policy(&self, block: &Block) -> bool {
        match &self.lib_policy {
            None => true,
            Some(policy) if policy.is_bypassing_lib_check() => true,
            Some(_) => self.check_min_producer_policy(block),
        }
    }

    /// Anti-centralization check on the producers behind `block`.
    ///
    /// While the chain is shorter than the minimum confirmation number, the
    /// producer of `block` must not appear among its ancestors. Afterwards the
    /// candidate plus its last `total_producers - 1` ancestors (genesis
    /// excluded) must come from at least that many distinct producers.
    pub fn check_min_producer_policy(&self, block: &Block) -> bool {
        let (min_producers, total_producers) = match &self.lib_policy {
            Some(policy) => (policy.min_confirmation_num(), policy.total_producers_num()),
            None => (0, 0),
        };
        let max_height = self.max_height();
        if max_height == 0 {
            return true;
        }

        let mut current = block.clone();
        if max_height < min_producers {
            for _ in 0..max_height {
                current = match self.get_block_by_hash(&current.prev_hash()) {
                    Ok(parent) => parent,
                    Err(e) => {
                        warn!("Cannot read parent while checking producers of {}: {}", block.hash(), e);
                        return false;
                    }
                };
                if current.producer() == block.producer() {
                    return false;
                }
            }
            return true;
        }

        let mut producers: HashSet<String> = HashSet::from([block.producer().to_string()]);
        for _ in 0..total_producers.saturating_sub(1) {
            current = match self.get_block_by_hash(&current.prev_hash()) {
                Ok(parent) => parent,
                Err(e) => {
                    warn!("Cannot read parent while checking producers of {}: {}", block.hash(), e);
                    return false;
                }
            };
            if current.height() == 0 {
                break;
            }
            producers.insert(current.producer().to_string());
        }

        if (producers.len() as u64) < min_producers {
            debug!(
                "Block {} has {} distinct recent producers, {} required",
                block.hash(),
                producers.len(),
                min_producers
            );
            return false;
        }
        true
    }
}

fn read_block(storage: &dyn Storage, hash: &BlockHash) -> ChainResult<Block> {
    storage::get_decoded(storage, &keys::block_key(hash))?.ok_or(ChainError::BlockNotFound(*hash))
}

/// Iterator over the chain from the tail to genesis.
pub struct LedgerIter<'a> {
    ledger: &'a Ledger,
    next: Option<BlockHash>,
}

impl Iterator for LedgerIter<'_> {
    type Item = ChainResult<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match self.ledger.get_block_by_hash(&hash) {
            Ok(block) => {
                if block.height() > 0 {
                    self.next = Some(block.prev_hash());
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
