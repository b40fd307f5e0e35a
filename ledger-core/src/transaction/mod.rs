//! Transaction model and classification.
//!
//! The core never executes transactions; it only needs to know which outputs a
//! transaction creates, which outputs it spends, and whether it is a
//! system-issued transaction (coinbase, rewards, gas accounting) that spends
//! nothing real.

pub mod journal;
mod pub_key_hash;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TransactionError;
use crate::types::Txid;

pub use journal::TxJournal;
pub use pub_key_hash::{
    MIN_PUB_KEY_LEN, PubKeyHash, VERSION_CONTRACT, VERSION_USER, is_valid_pub_key,
};

/// Input marker of a system-level reward distribution.
pub const REWARD_TX_DATA: &[u8] = b"Distribute X Rewards";
/// Input marker of a gas reward paid to the producer.
pub const GAS_REWARD_DATA: &[u8] = b"Miner Gas Rewards";
/// Input marker of unspent gas returned to the sender.
pub const GAS_CHANGE_DATA: &[u8] = b"Unspent Gas Change";
/// Output carrying the contract address of a contract transaction.
pub const CONTRACT_TX_OUTPUT_INDEX: usize = 0;
/// Output index used by coinbase-style inputs.
pub const COINBASE_VOUT: u32 = u32::MAX;

/// Reference to a previous output plus the spender's credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: Txid,
    pub vout: u32,
    pub signature: Vec<u8>,
    pub pub_key: Vec<u8>,
}

impl TxInput {
    pub fn new(txid: Txid, vout: u32, pub_key: impl Into<Vec<u8>>) -> Self {
        Self {
            txid,
            vout,
            signature: Vec::new(),
            pub_key: pub_key.into(),
        }
    }

    /// Input that spends nothing, carrying `data` in place of a public key.
    pub fn coinbase(data: impl Into<Vec<u8>>, signature: impl Into<Vec<u8>>) -> Self {
        Self {
            txid: Txid::zero(),
            vout: COINBASE_VOUT,
            signature: signature.into(),
            pub_key: data.into(),
        }
    }

    pub fn is_coinbase_style(&self) -> bool {
        self.txid.is_zero() && self.vout == COINBASE_VOUT
    }

    /// Owner of the output this input spends. A contract address is used as
    /// is; anything else must be a well-formed public key.
    pub fn owner(&self) -> Result<PubKeyHash, TransactionError> {
        let spender = PubKeyHash::from_bytes(self.pub_key.clone());
        if spender.is_contract().unwrap_or(false) {
            return Ok(spender);
        }
        PubKeyHash::from_pub_key(&self.pub_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: PubKeyHash,
    pub contract: String,
}

impl TxOutput {
    pub fn new(value: u64, pub_key_hash: PubKeyHash) -> Self {
        Self {
            value,
            pub_key_hash,
            contract: String::new(),
        }
    }

    pub fn new_contract(value: u64, pub_key_hash: PubKeyHash, contract: impl Into<String>) -> Self {
        Self {
            value,
            pub_key_hash,
            contract: contract.into(),
        }
    }
}

/// Derived transaction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    Normal,
    Contract,
    Coinbase,
    Reward,
    GasReward,
    GasChange,
    /// Issued by a contract execution; every input is a contract address.
    ContractGenerated,
}

impl TxKind {
    /// System transactions create outputs without spending real ones.
    pub fn is_system(self) -> bool {
        matches!(self, TxKind::Coinbase | TxKind::Reward | TxKind::GasReward | TxKind::GasChange)
    }

    /// Kinds whose inputs spend UTXOs.
    pub fn spends_inputs(self) -> bool {
        matches!(self, TxKind::Normal | TxKind::Contract | TxKind::ContractGenerated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Txid,
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
    pub tip: u64,
}

impl Transaction {
    /// Builds a transaction and computes its id.
    pub fn new(vin: Vec<TxInput>, vout: Vec<TxOutput>, tip: u64) -> Self {
        let mut tx = Self {
            id: Txid::zero(),
            vin,
            vout,
            tip,
        };
        tx.id = tx.calculate_id();
        tx
    }

    /// Coinbase paying `amount` to `to`. The height keeps ids unique across blocks.
    pub fn new_coinbase(to: PubKeyHash, amount: u64, height: u64) -> Self {
        Self::new(
            vec![TxInput::coinbase(format!("coinbase@{}", height).into_bytes(), height.to_be_bytes())],
            vec![TxOutput::new(amount, to)],
            0,
        )
    }

    pub fn new_reward(rewards: Vec<TxOutput>, height: u64) -> Self {
        Self::new(vec![TxInput::coinbase(REWARD_TX_DATA, height.to_be_bytes())], rewards, 0)
    }

    pub fn new_gas_reward(to: PubKeyHash, amount: u64, height: u64) -> Self {
        Self::new(
            vec![TxInput::coinbase(GAS_REWARD_DATA, height.to_be_bytes())],
            vec![TxOutput::new(amount, to)],
            0,
        )
    }

    pub fn new_gas_change(to: PubKeyHash, amount: u64, height: u64) -> Self {
        Self::new(
            vec![TxInput::coinbase(GAS_CHANGE_DATA, height.to_be_bytes())],
            vec![TxOutput::new(amount, to)],
            0,
        )
    }

    /// Hash over every input and output plus the tip.
    pub fn calculate_id(&self) -> Txid {
        let mut hasher = Sha256::new();
        for input in &self.vin {
            hasher.update(input.txid.as_bytes());
            hasher.update(input.vout.to_be_bytes());
            hasher.update(&input.signature);
            hasher.update(&input.pub_key);
        }
        for output in &self.vout {
            hasher.update(output.value.to_be_bytes());
            hasher.update(output.pub_key_hash.as_bytes());
            hasher.update(output.contract.as_bytes());
        }
        hasher.update(self.tip.to_be_bytes());
        Txid::new(hasher.finalize().into())
    }

    /// Classifies the transaction. Order matters: a transaction paying a
    /// contract is a contract transaction even if its input looks like a
    /// coinbase.
    pub fn kind(&self) -> TxKind {
        if self.is_contract() {
            TxKind::Contract
        } else if self.is_coinbase() {
            TxKind::Coinbase
        } else if self.is_marked_single_output(GAS_REWARD_DATA) {
            TxKind::GasReward
        } else if self.is_marked_single_output(GAS_CHANGE_DATA) {
            TxKind::GasChange
        } else if self.is_reward_tx() {
            TxKind::Reward
        } else if self.is_contract_generated() {
            TxKind::ContractGenerated
        } else {
            TxKind::Normal
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind().is_system()
    }

    pub fn is_contract(&self) -> bool {
        self.vout
            .get(CONTRACT_TX_OUTPUT_INDEX)
            .map(|out| out.pub_key_hash.is_contract().unwrap_or(false))
            .unwrap_or(false)
    }

    fn is_vin_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].is_coinbase_style()
    }

    fn is_coinbase(&self) -> bool {
        if !self.is_vin_coinbase() || self.vout.len() != 1 {
            return false;
        }
        let data = self.vin[0].pub_key.as_slice();
        !data.is_empty() && data != REWARD_TX_DATA && data != GAS_REWARD_DATA && data != GAS_CHANGE_DATA
    }

    fn is_reward_tx(&self) -> bool {
        self.is_vin_coinbase() && self.vin[0].pub_key == REWARD_TX_DATA
    }

    fn is_marked_single_output(&self, marker: &[u8]) -> bool {
        self.is_vin_coinbase() && self.vout.len() == 1 && self.vin[0].pub_key == marker
    }

    fn is_contract_generated(&self) -> bool {
        !self.vin.is_empty()
            && self.vin.iter().all(|vin| {
                PubKeyHash::from_bytes(vin.pub_key.clone()).is_contract().unwrap_or(false)
            })
    }

    pub fn total_output_value(&self) -> u64 {
        self.vout.iter().map(|out| out.value).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> PubKeyHash {
        PubKeyHash::from_pub_key(&[9u8; 33]).unwrap()
    }

    #[test]
    fn test_kind_detection() {
        assert_eq!(Transaction::new_coinbase(user(), 10, 1).kind(), TxKind::Coinbase);
        assert_eq!(
            Transaction::new_reward(vec![TxOutput::new(1, user()), TxOutput::new(2, user())], 1).kind(),
            TxKind::Reward
        );
        assert_eq!(Transaction::new_gas_reward(user(), 1, 1).kind(), TxKind::GasReward);
        assert_eq!(Transaction::new_gas_change(user(), 1, 1).kind(), TxKind::GasChange);

        let normal = Transaction::new(
            vec![TxInput::new(Txid::hash_of(b"prev"), 0, vec![9u8; 33])],
            vec![TxOutput::new(5, user())],
            0,
        );
        assert_eq!(normal.kind(), TxKind::Normal);
        assert!(!normal.is_system());

        let contract = Transaction::new(
            vec![TxInput::new(Txid::hash_of(b"prev"), 0, vec![9u8; 33])],
            vec![TxOutput::new_contract(0, PubKeyHash::new_contract(b"c"), "code")],
            0,
        );
        assert_eq!(contract.kind(), TxKind::Contract);

        let contract_addr = PubKeyHash::new_contract(b"c");
        let generated = Transaction::new(
            vec![TxInput::new(Txid::hash_of(b"prev"), 0, contract_addr.as_bytes().to_vec())],
            vec![TxOutput::new(5, user())],
            0,
        );
        assert_eq!(generated.kind(), TxKind::ContractGenerated);
    }

    #[test]
    fn test_coinbase_needs_data() {
        let tx = Transaction::new(
            vec![TxInput::coinbase(Vec::new(), Vec::new())],
            vec![TxOutput::new(1, user())],
            0,
        );
        assert_eq!(tx.kind(), TxKind::Normal);
    }

    #[test]
    fn test_coinbase_ids_differ_by_height() {
        assert_ne!(
            Transaction::new_coinbase(user(), 10, 1).id,
            Transaction::new_coinbase(user(), 10, 2).id
        );
    }

    #[test]
    fn test_total_output_value() {
        let tx = Transaction::new_reward(vec![TxOutput::new(3, user()), TxOutput::new(4, user())], 1);
        assert_eq!(tx.total_output_value(), 7);
    }
}
