//! Unspent transaction outputs.
//!
//! - [`UtxoSet`] holds the unspent outputs of one owner
//! - [`UtxoStore`] persists owner sets behind an LRU cache
//! - [`UtxoIndex`] stages additions and removals on top of the store

mod index;
mod store;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transaction::{PubKeyHash, TxOutput};
use crate::types::Txid;

pub use index::UtxoIndex;
pub use store::{DEFAULT_UTXO_CACHE_SIZE, UtxoStore};

/// How an output may be spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UtxoKind {
    Normal,
    /// First output written to a contract address; marks the deployment.
    ContractCreate,
    ContractInvoke,
}

/// Identifies an output by producing transaction and output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtxoKey {
    pub txid: Txid,
    pub index: u32,
}

impl UtxoKey {
    pub fn new(txid: Txid, index: u32) -> Self {
        Self {
            txid,
            index,
        }
    }
}

impl fmt::Display for UtxoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub value: u64,
    pub pub_key_hash: PubKeyHash,
    pub txid: Txid,
    pub tx_index: u32,
    pub kind: UtxoKind,
}

impl Utxo {
    pub fn new(output: &TxOutput, txid: Txid, tx_index: u32, kind: UtxoKind) -> Self {
        Self {
            value: output.value,
            pub_key_hash: output.pub_key_hash.clone(),
            txid,
            tx_index,
            kind,
        }
    }

    pub fn key(&self) -> UtxoKey {
        UtxoKey::new(self.txid, self.tx_index)
    }
}

/// Unspent outputs of a single owner, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoSet {
    utxos: BTreeMap<UtxoKey, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, utxo: Utxo) {
        self.utxos.insert(utxo.key(), utxo);
    }

    pub fn remove(&mut self, key: &UtxoKey) -> Option<Utxo> {
        self.utxos.remove(key)
    }

    pub fn get(&self, key: &UtxoKey) -> Option<&Utxo> {
        self.utxos.get(key)
    }

    pub fn contains(&self, key: &UtxoKey) -> bool {
        self.utxos.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.values()
    }

    pub fn total_value(&self) -> u64 {
        self.utxos.values().map(|u| u.value).sum()
    }
}

impl FromIterator<Utxo> for UtxoSet {
    fn from_iter<I: IntoIterator<Item = Utxo>>(iter: I) -> Self {
        let mut set = UtxoSet::new();
        for utxo in iter {
            set.put(utxo);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(tag: &[u8], value: u64, kind: UtxoKind) -> Utxo {
        let owner = PubKeyHash::new_contract(b"owner");
        Utxo::new(&TxOutput::new(value, owner), Txid::hash_of(tag), 0, kind)
    }

    #[test]
    fn test_put_replaces_same_key() {
        let mut set = UtxoSet::new();
        set.put(utxo(b"a", 1, UtxoKind::Normal));
        set.put(utxo(b"a", 2, UtxoKind::Normal));
        assert_eq!(set.len(), 1);
        assert_eq!(set.total_value(), 2);
    }
}
