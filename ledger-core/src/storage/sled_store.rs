//! Disk-backed storage on top of sled.

use std::path::Path;

use crate::error::StorageResult;
use crate::storage::{BatchOp, Storage, WriteBatch};

/// sled-backed key-value store. Batches are applied atomically.
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Opens (or creates) a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
        })
    }

    /// Opens a database that is deleted when dropped.
    pub fn temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
        })
    }
}

impl Storage for SledStorage {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.db.contains_key(key)?)
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => sled_batch.insert(key, value),
                BatchOp::Delete(key) => sled_batch.remove(key),
            }
        }
        self.db.apply_batch(sled_batch)?;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = SledStorage::open(temp_dir.path()).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(b"tailBlockHash".to_vec(), vec![7u8; 32]);
            batch.put(b"height:0".to_vec(), vec![7u8; 32]);
            storage.write_batch(batch).unwrap();
            storage.flush().unwrap();
        }

        let storage = SledStorage::open(temp_dir.path()).unwrap();
        assert_eq!(storage.get(b"tailBlockHash").unwrap(), Some(vec![7u8; 32]));
        assert!(storage.contains(b"height:0").unwrap());
    }

    #[test]
    fn test_temporary_delete() {
        let storage = SledStorage::temporary().unwrap();
        storage.put(b"k", b"v").unwrap();
        storage.delete(b"k").unwrap();
        assert_eq!(storage.get(b"k").unwrap(), None);
    }
}
