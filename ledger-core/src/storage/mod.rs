//! Key-value storage used by the ledger and the UTXO index.
//!
//! Everything the core persists goes through the [`Storage`] trait:
//!
//! - blocks and the height index
//! - tail and last-irreversible-block pointers
//! - per-owner UTXO sets
//! - transaction journals and contract-state changelogs
//!
//! Values are encoded with bincode over serde; [`keys`] owns the key layout.

pub mod keys;
mod memory;
mod sled_store;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageResult;

pub use memory::MemoryStorage;
pub use sled_store::SledStorage;

/// A single operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Operations applied together by [`Storage::write_batch`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    /// Encodes `value` and queues it under `key`.
    pub fn put_encoded<T: Serialize>(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: &T,
    ) -> StorageResult<()> {
        let bytes = encode(value)?;
        self.put(key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Byte-oriented key-value store.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    fn delete(&self, key: &[u8]) -> StorageResult<()>;

    fn contains(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Applies every operation of `batch`. Backends that support it apply the
    /// batch atomically.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Flushes buffered writes to durable storage.
    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Encodes a value with the crate-wide bincode configuration.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> StorageResult<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

/// Decodes a value written by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// Reads and decodes the value stored under `key`.
pub fn get_decoded<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &[u8],
) -> StorageResult<Option<T>> {
    match storage.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Encodes and stores `value` under `key`.
pub fn put_encoded<T: Serialize>(storage: &dyn Storage, key: &[u8], value: &T) -> StorageResult<()> {
    let bytes = encode(value)?;
    storage.put(key, &bytes)
}
