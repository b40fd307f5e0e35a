//! Block checks run before a block reaches the ledger.

use tracing::{debug, warn};

use crate::transaction::{Transaction, TxKind};
use crate::types::Block;
use crate::utxo::UtxoIndex;

/// Checks that the stored block hash matches its contents.
pub fn verify_block_hash(block: &Block) -> bool {
    if !block.verify_hash() {
        warn!("Block {} at height {} failed hash verification", block.hash(), block.height());
        return false;
    }
    true
}

/// Verifies the transactions of `block` against `index` and applies them.
///
/// Transactions are checked in block order, so a transaction may spend the
/// output of an earlier one in the same block. On success every transaction
/// has been staged into `index`; on failure `index` is left partially updated
/// and must be discarded.
pub fn verify_transactions(block: &Block, index: &UtxoIndex) -> bool {
    if block.transactions().is_empty() {
        debug!("Block {} has no transactions to verify", block.hash());
        return true;
    }

    let mut coinbase_seen = false;
    let mut reward_seen = false;
    for tx in block.transactions() {
        match tx.kind() {
            TxKind::Coinbase => {
                if coinbase_seen {
                    warn!("Block {} contains more than one coinbase", block.hash());
                    return false;
                }
                coinbase_seen = true;
            }
            TxKind::Reward => {
                if reward_seen {
                    warn!("Block {} contains more than one reward transaction", block.hash());
                    return false;
                }
                reward_seen = true;
            }
            kind if kind.spends_inputs() => {
                if !verify_inputs(tx, index) {
                    warn!("Transaction {} in block {} failed verification", tx.id, block.hash());
                    return false;
                }
            }
            _ => {}
        }

        if !index.update_utxo(tx) {
            warn!("Transaction {} in block {} could not be applied", tx.id, block.hash());
            return false;
        }
    }
    true
}

/// Every input must be unspent in `index` and the inputs must cover the
/// outputs plus the tip.
fn verify_inputs(tx: &Transaction, index: &UtxoIndex) -> bool {
    if tx.vin.is_empty() {
        return false;
    }

    let mut input_value = 0u64;
    for vin in &tx.vin {
        let owner = match vin.owner() {
            Ok(owner) => owner,
            Err(e) => {
                debug!("Input of {} has an invalid owner: {}", tx.id, e);
                return false;
            }
        };
        match index.find_utxo_by_vin(&owner, &vin.txid, vin.vout) {
            Ok(Some(utxo)) => input_value = input_value.saturating_add(utxo.value),
            Ok(None) => {
                debug!("Input {}:{} of {} is not unspent", vin.txid, vin.vout, tx.id);
                return false;
            }
            Err(e) => {
                warn!("Failed to look up input {}:{} of {}: {}", vin.txid, vin.vout, tx.id, e);
                return false;
            }
        }
    }

    let required = tx.total_output_value().saturating_add(tx.tip);
    if input_value < required {
        debug!("Transaction {} spends {} but its inputs hold {}", tx.id, required, input_value);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::test_utils::{spend_tx, test_owner};
    use crate::transaction::TxOutput;
    use crate::utxo::UtxoStore;

    fn funded_index() -> (UtxoIndex, Transaction) {
        let storage = Arc::new(MemoryStorage::new());
        let index = UtxoIndex::new(Arc::new(UtxoStore::new(storage)));
        let funding = Transaction::new_coinbase(test_owner(1), 10, 1);
        assert!(index.update_utxo(&funding));
        index.save().unwrap();
        (index, funding)
    }

    fn block_of(txs: Vec<Transaction>) -> Block {
        let genesis = Block::new_genesis(vec![], "p");
        Block::new(txs, Some(&genesis), "p")
    }

    #[test]
    fn test_verify_block_hash() {
        let block = block_of(vec![]);
        assert!(verify_block_hash(&block));
        let forged = block.clone().with_hash(crate::types::BlockHash::hash_of(b"forged"));
        assert!(!verify_block_hash(&forged));
    }

    #[test]
    fn test_valid_spend_is_applied() {
        let (index, funding) = funded_index();
        let spend = spend_tx(
            &[(funding.id, 0, 1)],
            vec![TxOutput::new(7, test_owner(2)), TxOutput::new(2, test_owner(1))],
        );
        let block = block_of(vec![Transaction::new_coinbase(test_owner(3), 10, 2), spend]);

        assert!(verify_transactions(&block, &index));
        assert_eq!(index.get_all_utxos_by_pub_key_hash(&test_owner(2)).unwrap().total_value(), 7);
        assert_eq!(index.get_all_utxos_by_pub_key_hash(&test_owner(1)).unwrap().total_value(), 2);
    }

    #[test]
    fn test_overspend_is_rejected() {
        let (index, funding) = funded_index();
        let mut spend = spend_tx(&[(funding.id, 0, 1)], vec![TxOutput::new(9, test_owner(2))]);
        spend.tip = 2;
        spend.id = spend.calculate_id();
        assert!(!verify_transactions(&block_of(vec![spend]), &index));
    }

    #[test]
    fn test_double_spend_in_block_is_rejected() {
        let (index, funding) = funded_index();
        let first = spend_tx(&[(funding.id, 0, 1)], vec![TxOutput::new(10, test_owner(2))]);
        let second = spend_tx(&[(funding.id, 0, 1)], vec![TxOutput::new(5, test_owner(3))]);
        assert!(!verify_transactions(&block_of(vec![first, second]), &index));
    }

    #[test]
    fn test_chained_spend_within_block() {
        let (index, funding) = funded_index();
        let first = spend_tx(&[(funding.id, 0, 1)], vec![TxOutput::new(10, test_owner(2))]);
        let second = spend_tx(&[(first.id, 0, 2)], vec![TxOutput::new(10, test_owner(3))]);
        assert!(verify_transactions(&block_of(vec![first, second]), &index));
        assert_eq!(index.get_all_utxos_by_pub_key_hash(&test_owner(3)).unwrap().total_value(), 10);
    }

    #[test]
    fn test_second_coinbase_is_rejected() {
        let (index, _) = funded_index();
        let block = block_of(vec![
            Transaction::new_coinbase(test_owner(1), 10, 2),
            Transaction::new_coinbase(test_owner(2), 10, 3),
        ]);
        assert!(!verify_transactions(&block, &index));
    }

    #[test]
    fn test_empty_block_is_valid() {
        let (index, _) = funded_index();
        assert!(verify_transactions(&block_of(vec![]), &index));
        assert!(index.is_staged_empty());
    }
}
