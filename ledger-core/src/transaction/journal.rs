//! Transaction journals.
//!
//! A journal records the outputs of a committed transaction so that undoing a
//! later block can recreate the outputs its inputs consumed.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StorageResult, UtxoError, UtxoResult};
use crate::storage::{self, Storage, WriteBatch, keys};
use crate::transaction::{Transaction, TxInput, TxOutput};
use crate::types::Txid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxJournal {
    pub txid: Txid,
    pub vout: Vec<TxOutput>,
}

impl TxJournal {
    pub fn new(tx: &Transaction) -> Self {
        Self {
            txid: tx.id,
            vout: tx.vout.clone(),
        }
    }

    /// Queues the journal of `tx` into `batch`.
    pub fn put(tx: &Transaction, batch: &mut WriteBatch) -> StorageResult<()> {
        let journal = Self::new(tx);
        batch.put_encoded(keys::tx_journal_key(&journal.txid), &journal)
    }

    pub fn load(txid: &Txid, storage: &dyn Storage) -> StorageResult<Option<Self>> {
        storage::get_decoded(storage, &keys::tx_journal_key(txid))
    }
}

/// Looks up the output an input spent.
pub fn get_tx_output(vin: &TxInput, storage: &dyn Storage) -> UtxoResult<TxOutput> {
    let journal = match TxJournal::load(&vin.txid, storage) {
        Ok(Some(journal)) => journal,
        Ok(None) => {
            warn!("No journal for transaction {} referenced by input {}", vin.txid, vin.vout);
            return Err(UtxoError::TxInputInvalid(vin.txid.to_hex()));
        }
        Err(e) => {
            warn!("Failed to read journal for transaction {}: {}", vin.txid, e);
            return Err(UtxoError::TxInputInvalid(vin.txid.to_hex()));
        }
    };

    journal.vout.get(vin.vout as usize).cloned().ok_or_else(|| UtxoError::VoutNotFound {
        txid: vin.txid.to_hex(),
        index: vin.vout,
    })
}
