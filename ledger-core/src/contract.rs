//! Contract storage state and its per-block changelog.
//!
//! The virtual machine that mutates this state lives outside the core. The
//! ledger only persists it: every time a block is appended, the values the
//! block overwrote are logged under `scLog:<block hash>`. Walking back over a
//! block replays that log to recover the previous state, symmetrically with
//! [`crate::utxo::UtxoIndex::undo_txs_in_block`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageResult;
use crate::storage::{self, Storage, WriteBatch, keys};
use crate::types::BlockHash;

/// Old values overwritten by one block, keyed by contract address then key.
/// `None` means the key did not exist before the block.
pub type ChangeLog = BTreeMap<String, BTreeMap<String, Option<String>>>;

/// Key-value storage of every contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractState {
    states: BTreeMap<String, BTreeMap<String, String>>,
}

impl ContractState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the persisted state; empty if nothing was saved yet.
    pub fn load(storage: &dyn Storage) -> StorageResult<Self> {
        Ok(storage::get_decoded(storage, keys::CONTRACT_STATE_KEY)?.unwrap_or_default())
    }

    pub fn get(&self, address: &str, key: &str) -> Option<&str> {
        self.states.get(address)?.get(key).map(String::as_str)
    }

    pub fn set(&mut self, address: impl Into<String>, key: impl Into<String>, value: impl Into<String>) {
        self.states.entry(address.into()).or_default().insert(key.into(), value.into());
    }

    pub fn delete(&mut self, address: &str, key: &str) {
        if let Some(state) = self.states.get_mut(address) {
            state.remove(key);
            if state.is_empty() {
                self.states.remove(address);
            }
        }
    }

    pub fn state_of(&self, address: &str) -> Option<&BTreeMap<String, String>> {
        self.states.get(address)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Old values of every entry that differs between `old` and `self`.
    pub fn change_log_since(&self, old: &ContractState) -> ChangeLog {
        let mut log = ChangeLog::new();
        let addresses = self.states.keys().chain(old.states.keys());
        for address in addresses {
            let new_state = self.states.get(address);
            let old_state = old.states.get(address);
            let keys = new_state
                .into_iter()
                .flat_map(|s| s.keys())
                .chain(old_state.into_iter().flat_map(|s| s.keys()));
            for key in keys {
                let new_value = new_state.and_then(|s| s.get(key));
                let old_value = old_state.and_then(|s| s.get(key));
                if new_value != old_value {
                    log.entry(address.clone()).or_default().insert(key.clone(), old_value.cloned());
                }
            }
        }
        log
    }

    /// Queues this state and its changelog against `block_hash` into `batch`.
    pub fn stage_save(
        &self,
        storage: &dyn Storage,
        block_hash: &BlockHash,
        batch: &mut WriteBatch,
    ) -> StorageResult<()> {
        let previous = Self::load(storage)?;
        let log = self.change_log_since(&previous);
        debug!("Contract state changelog for block {} touches {} contracts", block_hash, log.len());
        batch.put_encoded(keys::contract_log_key(block_hash), &log)?;
        batch.put_encoded(keys::CONTRACT_STATE_KEY.to_vec(), self)
    }

    /// Persists this state with a changelog for `block_hash`.
    pub fn save(&self, storage: &dyn Storage, block_hash: &BlockHash) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        self.stage_save(storage, block_hash, &mut batch)?;
        storage.write_batch(batch)
    }

    /// Persists this state without touching any changelog.
    pub fn persist(&self, storage: &dyn Storage) -> StorageResult<()> {
        storage::put_encoded(storage, keys::CONTRACT_STATE_KEY, self)
    }

    /// Undoes the changes `block_hash` made, using its changelog. A block
    /// without a changelog changed nothing.
    pub fn revert_state(&mut self, storage: &dyn Storage, block_hash: &BlockHash) -> StorageResult<()> {
        let log: ChangeLog = match storage::get_decoded(storage, &keys::contract_log_key(block_hash))? {
            Some(log) => log,
            None => {
                debug!("No contract changelog for block {}", block_hash);
                return Ok(());
            }
        };

        for (address, entries) in log {
            for (key, old_value) in entries {
                match old_value {
                    Some(value) => self.set(address.clone(), key, value),
                    None => self.delete(&address, &key),
                }
            }
        }
        Ok(())
    }
}
