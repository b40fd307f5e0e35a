//! Persistent per-owner UTXO sets with an LRU read cache.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::StorageResult;
use crate::storage::{self, Storage, keys};
use crate::transaction::PubKeyHash;
use crate::utxo::UtxoSet;

/// Number of owner sets kept in memory.
pub const DEFAULT_UTXO_CACHE_SIZE: usize = 1024;

/// Committed UTXO sets, keyed by owner.
pub struct UtxoStore {
    storage: Arc<dyn Storage>,
    cache: Mutex<LruCache<PubKeyHash, Arc<UtxoSet>>>,
}

impl UtxoStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_capacity(storage, DEFAULT_UTXO_CACHE_SIZE)
    }

    pub fn with_capacity(storage: Arc<dyn Storage>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            storage,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Committed set of `owner`; empty if the owner has none.
    pub fn get(&self, owner: &PubKeyHash) -> StorageResult<Arc<UtxoSet>> {
        if let Some(set) = self.cache.lock().get(owner) {
            return Ok(Arc::clone(set));
        }

        let set: UtxoSet =
            storage::get_decoded(self.storage.as_ref(), &keys::utxo_key(owner))?.unwrap_or_default();
        let set = Arc::new(set);
        self.cache.lock().put(owner.clone(), Arc::clone(&set));
        Ok(set)
    }

    /// Applies `added` then `removed` to the committed set of `owner` and
    /// writes the result. Removing an absent key is not an error, so a commit
    /// can be replayed.
    pub fn commit(&self, owner: &PubKeyHash, added: &UtxoSet, removed: &UtxoSet) -> StorageResult<()> {
        let mut set = (*self.get(owner)?).clone();
        for utxo in added.iter() {
            set.put(utxo.clone());
        }
        for utxo in removed.iter() {
            set.remove(&utxo.key());
        }

        let key = keys::utxo_key(owner);
        if set.is_empty() {
            self.storage.delete(&key)?;
        } else {
            storage::put_encoded(self.storage.as_ref(), &key, &set)?;
        }
        trace!(
            "Committed UTXOs for {}: +{} -{} (now {})",
            owner,
            added.len(),
            removed.len(),
            set.len()
        );

        self.cache.lock().put(owner.clone(), Arc::new(set));
        Ok(())
    }

    /// Drops every cached set; the next read goes to storage.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}
