//! Staged UTXO index.
//!
//! The index layers two staged maps over the committed [`UtxoStore`]:
//! outputs created since the last [`UtxoIndex::save`] and committed outputs
//! spent since then. A key is staged in at most one of the two maps, so the
//! staging is a single in-flight delta rather than a log. The view of an
//! owner is `committed + added - removed`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{StorageResult, UtxoError, UtxoResult};
use crate::transaction::{PubKeyHash, Transaction, TxOutput, journal};
use crate::types::{Block, Txid};
use crate::utxo::{Utxo, UtxoKey, UtxoKind, UtxoSet, UtxoStore};

#[derive(Debug, Clone, Default)]
struct StagedDelta {
    added: HashMap<PubKeyHash, UtxoSet>,
    removed: HashMap<PubKeyHash, UtxoSet>,
}

impl StagedDelta {
    fn stage_add(&mut self, utxo: Utxo) {
        let owner = utxo.pub_key_hash.clone();
        let key = utxo.key();
        if let Some(removed) = self.removed.get_mut(&owner) {
            if removed.remove(&key).is_some() {
                if removed.is_empty() {
                    self.removed.remove(&owner);
                }
                return;
            }
        }
        self.added.entry(owner).or_default().put(utxo);
    }

    fn stage_remove(&mut self, utxo: Utxo) {
        let owner = utxo.pub_key_hash.clone();
        let key = utxo.key();
        if let Some(added) = self.added.get_mut(&owner) {
            if added.remove(&key).is_some() {
                if added.is_empty() {
                    self.added.remove(&owner);
                }
                return;
            }
        }
        self.removed.entry(owner).or_default().put(utxo);
    }
}

/// Revertible view of unspent outputs.
pub struct UtxoIndex {
    staged: RwLock<StagedDelta>,
    store: Arc<UtxoStore>,
}

impl UtxoIndex {
    pub fn new(store: Arc<UtxoStore>) -> Self {
        Self {
            staged: RwLock::new(StagedDelta::default()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<UtxoStore> {
        &self.store
    }

    /// Independent index over the same store with a copy of the staged delta.
    pub fn deep_copy(&self) -> UtxoIndex {
        UtxoIndex {
            staged: RwLock::new(self.staged.read().clone()),
            store: Arc::clone(&self.store),
        }
    }

    /// All unspent outputs currently visible for `owner`.
    pub fn get_all_utxos_by_pub_key_hash(&self, owner: &PubKeyHash) -> UtxoResult<UtxoSet> {
        let committed = self.store.get(owner)?;
        let staged = self.staged.read();

        let mut view = (*committed).clone();
        if let Some(removed) = staged.removed.get(owner) {
            for utxo in removed.iter() {
                view.remove(&utxo.key());
            }
        }
        if let Some(added) = staged.added.get(owner) {
            for utxo in added.iter() {
                view.put(utxo.clone());
            }
        }
        Ok(view)
    }

    pub fn find_utxo_by_vin(
        &self,
        owner: &PubKeyHash,
        txid: &Txid,
        index: u32,
    ) -> UtxoResult<Option<Utxo>> {
        let view = self.get_all_utxos_by_pub_key_hash(owner)?;
        Ok(view.get(&UtxoKey::new(*txid, index)).cloned())
    }

    /// Deployment output of the contract at `owner`, if any.
    pub fn get_contract_create_utxo(&self, owner: &PubKeyHash) -> UtxoResult<Option<Utxo>> {
        let view = self.get_all_utxos_by_pub_key_hash(owner)?;
        Ok(view.iter().find(|u| u.kind == UtxoKind::ContractCreate).cloned())
    }

    /// Outputs of the contract at `owner` other than its deployment output.
    pub fn get_contract_invoke_utxos(&self, owner: &PubKeyHash) -> UtxoResult<Vec<Utxo>> {
        let view = self.get_all_utxos_by_pub_key_hash(owner)?;
        Ok(view.iter().filter(|u| u.kind != UtxoKind::ContractCreate).cloned().collect())
    }

    /// Stages `output` as unspent.
    ///
    /// The kind is derived: the first output written to a contract address
    /// with no visible outputs is its deployment, later ones are invocations.
    pub fn add_utxo(&self, output: &TxOutput, txid: &Txid, index: u32) -> UtxoResult<()> {
        let kind = if output.pub_key_hash.is_contract().unwrap_or(false) {
            if self.get_all_utxos_by_pub_key_hash(&output.pub_key_hash)?.is_empty() {
                UtxoKind::ContractCreate
            } else {
                UtxoKind::ContractInvoke
            }
        } else {
            UtxoKind::Normal
        };

        self.staged.write().stage_add(Utxo::new(output, *txid, index, kind));
        Ok(())
    }

    /// Stages the removal of a visible output and returns it.
    pub(crate) fn remove_utxo(&self, owner: &PubKeyHash, txid: &Txid, index: u32) -> UtxoResult<Utxo> {
        let utxo = self
            .find_utxo_by_vin(owner, txid, index)?
            .ok_or(UtxoError::UtxoNotFound(UtxoKey::new(*txid, index)))?;

        self.staged.write().stage_remove(utxo.clone());
        Ok(utxo)
    }

    /// Applies `tx`: spends its inputs, then adds its outputs.
    ///
    /// Returns false on the first input that cannot be resolved or spent.
    /// Changes made before the failure are not undone; callers must discard
    /// the index (or its copy) in that case.
    pub fn update_utxo(&self, tx: &Transaction) -> bool {
        if tx.kind().spends_inputs() {
            for vin in &tx.vin {
                let owner = match vin.owner() {
                    Ok(owner) => owner,
                    Err(e) => {
                        warn!("Invalid public key in input of {}, discarding update: {}", tx.id, e);
                        return false;
                    }
                };

                if let Err(e) = self.remove_utxo(&owner, &vin.txid, vin.vout) {
                    warn!("Failed to spend input of {}, discarding update: {}", tx.id, e);
                    return false;
                }
            }
        }

        for (index, output) in tx.vout.iter().enumerate() {
            if let Err(e) = self.add_utxo(output, &tx.id, index as u32) {
                warn!("Failed to add output {} of {}: {}", index, tx.id, e);
                return false;
            }
        }
        true
    }

    /// Applies every transaction in order, stopping at the first failure.
    pub fn update_utxo_state(&self, txs: &[Transaction]) -> bool {
        txs.iter().all(|tx| self.update_utxo(tx))
    }

    /// Reverses the effect of `block` on the index.
    ///
    /// Transactions are undone newest first: their outputs are removed and,
    /// unless they are system transactions, the outputs their inputs spent
    /// are restored from the transaction journal.
    pub fn undo_txs_in_block(&self, block: &Block) -> UtxoResult<()> {
        let storage = Arc::clone(self.store.storage());
        for tx in block.transactions().iter().rev() {
            for (index, output) in tx.vout.iter().enumerate() {
                self.remove_utxo(&output.pub_key_hash, &tx.id, index as u32)?;
            }

            if tx.is_system() {
                continue;
            }

            for vin in &tx.vin {
                let spent = journal::get_tx_output(vin, storage.as_ref())?;
                self.add_utxo(&spent, &vin.txid, vin.vout)?;
            }
        }
        debug!("Undid {} transactions of block {}", block.transactions().len(), block.hash());
        Ok(())
    }

    /// Greedily selects outputs of `owner` covering `amount`.
    ///
    /// Staged additions are used first, then committed outputs that are not
    /// staged for removal. Contract deployment outputs are never selected.
    pub fn get_utxos_according_to_amount(
        &self,
        owner: &PubKeyHash,
        amount: u64,
    ) -> UtxoResult<Vec<Utxo>> {
        let committed = self.store.get(owner)?;
        let staged = self.staged.read();
        let removed = staged.removed.get(owner);
        let is_removed = |utxo: &Utxo| removed.map(|r| r.contains(&utxo.key())).unwrap_or(false);

        let mut picked = Vec::new();
        let mut taken: HashSet<UtxoKey> = HashSet::new();
        let mut sum = 0u64;

        let staged_added = staged.added.get(owner).into_iter().flat_map(|set| set.iter());
        for utxo in staged_added.chain(committed.iter()) {
            if sum >= amount {
                break;
            }
            if utxo.kind == UtxoKind::ContractCreate || is_removed(utxo) || !taken.insert(utxo.key()) {
                continue;
            }
            sum = sum.saturating_add(utxo.value);
            picked.push(utxo.clone());
        }

        if sum < amount {
            return Err(UtxoError::InsufficientFunds {
                requested: amount,
                available: sum,
            });
        }
        Ok(picked)
    }

    /// Commits the staged delta to the store and clears it.
    ///
    /// Owners are committed one at a time, so a failure part-way leaves some
    /// owners committed. The delta is kept on failure and committing it again
    /// is safe.
    pub fn save(&self) -> StorageResult<()> {
        let mut staged = self.staged.write();

        let owners: HashSet<&PubKeyHash> = staged.added.keys().chain(staged.removed.keys()).collect();
        let empty = UtxoSet::new();
        for owner in owners {
            let added = staged.added.get(owner).unwrap_or(&empty);
            let removed = staged.removed.get(owner).unwrap_or(&empty);
            self.store.commit(owner, added, removed)?;
        }

        *staged = StagedDelta::default();
        Ok(())
    }

    /// Number of staged additions across all owners.
    pub fn staged_add_count(&self) -> usize {
        self.staged.read().added.values().map(UtxoSet::len).sum()
    }

    /// Number of staged removals across all owners.
    pub fn staged_remove_count(&self) -> usize {
        self.staged.read().removed.values().map(UtxoSet::len).sum()
    }

    pub fn is_staged_empty(&self) -> bool {
        let staged = self.staged.read();
        staged.added.is_empty() && staged.removed.is_empty()
    }
}

impl std::fmt::Debug for UtxoIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtxoIndex")
            .field("staged_add", &self.staged_add_count())
            .field("staged_remove", &self.staged_remove_count())
            .finish()
    }
}
