//! Core block types shared by the ledger, the fork pool and the UTXO index.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::transaction::Transaction;

/// Timestamp stamped on genesis blocks so every node derives the same genesis hash.
pub const GENESIS_TIMESTAMP: i64 = 1_532_392_928;

macro_rules! hash_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Wraps raw hash bytes.
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// The all-zero hash, used as "no hash".
            pub const fn zero() -> Self {
                Self([0u8; 32])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Builds a hash from a slice, returning `None` unless it is exactly 32 bytes.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; 32] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                Self::from_slice(&bytes)
            }

            /// SHA-256 of arbitrary data.
            pub fn hash_of(data: &[u8]) -> Self {
                Self(Sha256::digest(data).into())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }
    };
}

hash_newtype!(BlockHash, "Hash identifying a block.");
hash_newtype!(Txid, "Hash identifying a transaction.");

/// Block header. The hash is stored so blocks received from peers keep the
/// identity they were announced with; [`Block::verify_hash`] checks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub height: u64,
    pub timestamp: i64,
    pub producer: String,
    pub nonce: u64,
    pub signature: Vec<u8>,
}

/// A block: header plus ordered transactions.
///
/// Two blocks are equal iff their hashes are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.header.hash == other.header.hash
    }
}

impl Eq for Block {}

impl Block {
    /// Creates and seals a block on top of `parent`.
    ///
    /// Without a parent the block gets height 1; use [`Block::new_genesis`]
    /// for a height-0 genesis block.
    pub fn new(
        transactions: Vec<Transaction>,
        parent: Option<&Block>,
        producer: impl Into<String>,
    ) -> Self {
        let (prev_hash, height) = match parent {
            Some(parent) => (parent.hash(), parent.height() + 1),
            None => (BlockHash::zero(), 1),
        };
        let header = BlockHeader {
            hash: BlockHash::zero(),
            prev_hash,
            height,
            timestamp: chrono::Utc::now().timestamp(),
            producer: producer.into(),
            nonce: 0,
            signature: Vec::new(),
        };
        Self::from_header(header, transactions).seal()
    }

    /// Creates the height-0 genesis block.
    pub fn new_genesis(transactions: Vec<Transaction>, producer: impl Into<String>) -> Self {
        let header = BlockHeader {
            hash: BlockHash::zero(),
            prev_hash: BlockHash::zero(),
            height: 0,
            timestamp: GENESIS_TIMESTAMP,
            producer: producer.into(),
            nonce: 0,
            signature: Vec::new(),
        };
        Self::from_header(header, transactions).seal()
    }

    /// Builds a block from raw header information without recomputing the hash.
    pub fn from_header(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Recomputes and stores the block hash.
    pub fn seal(mut self) -> Self {
        self.header.hash = self.calculate_hash();
        self
    }

    /// Returns a resealed copy with a different nonce.
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.header.nonce = nonce;
        self.seal()
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.header.signature = signature;
        self
    }

    /// Returns a copy carrying `hash` as is. The block no longer passes
    /// [`Block::verify_hash`] unless `hash` is the computed one.
    pub fn with_hash(mut self, hash: BlockHash) -> Self {
        self.header.hash = hash;
        self
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.header.prev_hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn producer(&self) -> &str {
        &self.header.producer
    }

    pub fn nonce(&self) -> u64 {
        self.header.nonce
    }

    pub fn signature(&self) -> &[u8] {
        &self.header.signature
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Hash over all transaction ids in block order.
    pub fn hash_transactions(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for tx in &self.transactions {
            hasher.update(tx.id.as_bytes());
        }
        hasher.finalize().into()
    }

    /// sha256(prev_hash ‖ tx hash ‖ timestamp ‖ nonce ‖ producer)
    pub fn calculate_hash(&self) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(self.header.prev_hash.as_bytes());
        hasher.update(self.hash_transactions());
        hasher.update(self.header.timestamp.to_be_bytes());
        hasher.update(self.header.nonce.to_be_bytes());
        hasher.update(self.header.producer.as_bytes());
        BlockHash::new(hasher.finalize().into())
    }

    /// Checks that the stored hash matches the block contents.
    pub fn verify_hash(&self) -> bool {
        self.header.hash == self.calculate_hash()
    }
}
