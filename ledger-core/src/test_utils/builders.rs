use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::{BlockContext, ForkPool, Ledger, verify_transactions};
use crate::config::LedgerConfig;
use crate::contract::ContractState;
use crate::interface::{LibPolicy, Mempool};
use crate::storage::Storage;
use crate::transaction::{PubKeyHash, Transaction, TxInput, TxOutput};
use crate::types::{Block, BlockHash, BlockHeader, Txid};

/// Deterministic 33-byte public key for `seed`.
pub fn test_pub_key(seed: u8) -> Vec<u8> {
    let mut key = vec![seed; 33];
    key[0] = 0x02;
    key
}

pub fn test_owner(seed: u8) -> PubKeyHash {
    PubKeyHash::from_pub_key(&test_pub_key(seed)).expect("test key is valid")
}

/// Transaction spending `(txid, vout, key seed)` inputs into `outputs`.
pub fn spend_tx(inputs: &[(Txid, u32, u8)], outputs: Vec<TxOutput>) -> Transaction {
    let vin = inputs
        .iter()
        .map(|(txid, vout, seed)| TxInput::new(*txid, *vout, test_pub_key(*seed)))
        .collect();
    Transaction::new(vin, outputs, 0)
}

pub fn label_hash(label: &str) -> BlockHash {
    BlockHash::hash_of(label.as_bytes())
}

/// Empty block whose hash is `label_hash(label)`, on top of `prev` (zero
/// hash when `None`).
pub fn block_with_hash(label: &str, prev: Option<&str>, height: u64) -> Block {
    let header = BlockHeader {
        hash: label_hash(label),
        prev_hash: prev.map(label_hash).unwrap_or_else(BlockHash::zero),
        height,
        timestamp: 0,
        producer: String::new(),
        nonce: 0,
        signature: Vec::new(),
    };
    Block::from_header(header, Vec::new())
}

/// Builds a pool from comma separated tokens.
///
/// `a#b` is block `b` on top of `a`, `h^x` is block `x` at height `h` with a
/// zero parent, a bare label is `x` at height 0. The first token becomes the
/// pool root; the others are added in order.
pub fn deserialize_pool(notation: &str) -> (ForkPool, HashMap<String, Block>) {
    let pool = ForkPool::default();
    let mut blocks: HashMap<String, Block> = HashMap::new();

    for (i, token) in notation.split(',').map(str::trim).filter(|t| !t.is_empty()).enumerate() {
        let (label, block) = if let Some((parent, label)) = token.split_once('#') {
            let height = blocks.get(parent).map(|b| b.height() + 1).expect("parent declared first");
            (label, block_with_hash(label, Some(parent), height))
        } else if let Some((height, label)) = token.split_once('^') {
            (label, block_with_hash(label, None, height.parse().expect("numeric height")))
        } else {
            (token, block_with_hash(token, None, 0))
        };

        if i == 0 {
            pool.set_root_block(&block);
        } else {
            pool.add_block(&block);
        }
        blocks.insert(label.to_string(), block);
    }
    (pool, blocks)
}

/// Ledger over a given storage with helpers to grow it.
pub struct TestChain {
    pub ledger: Arc<Ledger>,
}

impl TestChain {
    /// Genesis paying 100 to `test_owner(1)`.
    pub fn new(
        storage: Arc<dyn Storage>,
        mempool: Arc<dyn Mempool>,
        lib_policy: Option<Arc<dyn LibPolicy>>,
    ) -> Self {
        let genesis =
            Block::new_genesis(vec![Transaction::new_coinbase(test_owner(1), 100, 0)], "genesis");
        let ledger = Ledger::create(genesis, storage, mempool, lib_policy, &LedgerConfig::default())
            .expect("genesis applies");
        Self {
            ledger: Arc::new(ledger),
        }
    }

    pub fn genesis(&self) -> Block {
        self.ledger.get_block_by_height(0).expect("genesis is stored")
    }

    /// Appends a block with `txs` by `producer` on top of the tail.
    pub fn append(&self, txs: Vec<Transaction>, producer: &str) -> Block {
        let state = self.ledger.contract_state().expect("contract state loads");
        self.append_with_state(txs, producer, state)
    }

    /// Appends a block whose execution left the contracts in `state`.
    pub fn append_with_state(&self, txs: Vec<Transaction>, producer: &str, state: ContractState) -> Block {
        let block = Block::new(txs, Some(&self.ledger.tail_block()), producer);
        let index = self.ledger.utxo_index();
        assert!(verify_transactions(&block, &index), "block {} verifies", block.hash());
        self.ledger
            .add_block_context_to_tail(&BlockContext::new(block.clone(), index, state))
            .expect("block appends");
        block
    }

    /// Empty blocks by `producer` on top of `parent`, not appended.
    pub fn fork_from(parent: &Block, len: usize, producer: &str) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::with_capacity(len);
        for _ in 0..len {
            let prev = blocks.last().unwrap_or(parent);
            blocks.push(Block::new(Vec::new(), Some(prev), producer));
        }
        blocks
    }
}
