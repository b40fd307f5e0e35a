use std::collections::HashSet;

use parking_lot::RwLock;

use crate::error::{StorageError, StorageResult};
use crate::storage::{BatchOp, MemoryStorage, Storage, WriteBatch};

/// In-memory storage that refuses writes to poisoned keys.
///
/// A batch touching a poisoned key is rejected as a whole.
#[derive(Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    poisoned: RwLock<HashSet<Vec<u8>>>,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poison(&self, key: impl Into<Vec<u8>>) {
        self.poisoned.write().insert(key.into());
    }

    pub fn heal(&self) {
        self.poisoned.write().clear();
    }

    fn check(&self, key: &[u8]) -> StorageResult<()> {
        if self.poisoned.read().contains(key) {
            return Err(StorageError::WriteFailed(format!("key {} is poisoned", hex::encode(key))));
        }
        Ok(())
    }
}

impl Storage for FailingStorage {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.check(key)?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.check(key)?;
        self.inner.delete(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        for op in batch.ops() {
            match op {
                BatchOp::Put(key, _) | BatchOp::Delete(key) => self.check(key)?,
            }
        }
        self.inner.write_batch(batch)
    }
}
