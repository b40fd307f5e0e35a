//! Persisted key layout.

use crate::transaction::PubKeyHash;
use crate::types::{BlockHash, Txid};

/// Key holding the hash of the canonical tail block.
pub const TAIL_BLOCK_HASH_KEY: &[u8] = b"tailBlockHash";

/// Key holding the hash of the last irreversible block.
pub const LIB_BLOCK_HASH_KEY: &[u8] = b"lastIrreversibleBlockHash";

/// Key holding the current contract state.
pub const CONTRACT_STATE_KEY: &[u8] = b"scState";

/// Blocks are stored under their raw 32-byte hash.
pub fn block_key(hash: &BlockHash) -> Vec<u8> {
    hash.as_bytes().to_vec()
}

pub fn height_key(height: u64) -> Vec<u8> {
    format!("height:{}", height).into_bytes()
}

pub fn utxo_key(owner: &PubKeyHash) -> Vec<u8> {
    format!("utxo:{}", owner.to_hex()).into_bytes()
}

pub fn tx_journal_key(txid: &Txid) -> Vec<u8> {
    format!("tx_journal_{}", txid.to_hex()).into_bytes()
}

/// Changelog written when the contract state is saved for a block.
pub fn contract_log_key(hash: &BlockHash) -> Vec<u8> {
    format!("scLog:{}", hash.to_hex()).into_bytes()
}
