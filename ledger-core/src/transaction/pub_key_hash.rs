use std::fmt;

use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TransactionError;

/// Version byte of an address owned by a key pair.
pub const VERSION_USER: u8 = 0x5A;
/// Version byte of an address owned by a contract.
pub const VERSION_CONTRACT: u8 = 0x58;
/// Public keys shorter than this are rejected.
pub const MIN_PUB_KEY_LEN: usize = 32;

/// Owner of an output: a version byte followed by a 20-byte digest.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PubKeyHash(Vec<u8>);

impl PubKeyHash {
    /// Wraps raw bytes without validation.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Derives the user address for `pub_key`.
    pub fn from_pub_key(pub_key: &[u8]) -> Result<Self, TransactionError> {
        is_valid_pub_key(pub_key)?;
        Ok(Self::with_version(VERSION_USER, pub_key))
    }

    /// Derives a contract address from `seed` (typically the deploying txid).
    pub fn new_contract(seed: &[u8]) -> Self {
        Self::with_version(VERSION_CONTRACT, seed)
    }

    fn with_version(version: u8, payload: &[u8]) -> Self {
        let digest = Ripemd160::digest(Sha256::digest(payload));
        let mut bytes = Vec::with_capacity(1 + digest.len());
        bytes.push(version);
        bytes.extend_from_slice(&digest);
        Self(bytes)
    }

    pub fn is_contract(&self) -> Result<bool, TransactionError> {
        match self.0.first() {
            Some(&VERSION_USER) => Ok(false),
            Some(&VERSION_CONTRACT) => Ok(true),
            _ => Err(TransactionError::InvalidPubKeyHashVersion),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for PubKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PubKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKeyHash({})", self.to_hex())
    }
}

/// Rejects public keys that are too short to be real keys.
pub fn is_valid_pub_key(pub_key: &[u8]) -> Result<(), TransactionError> {
    if pub_key.len() < MIN_PUB_KEY_LEN {
        return Err(TransactionError::InvalidPubKey {
            expected: MIN_PUB_KEY_LEN,
            actual: pub_key.len(),
        });
    }
    Ok(())
}
