//! Configuration of the ledger core.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::chain::fork_pool::DEFAULT_FORK_POOL_CAPACITY;
use crate::error::StorageResult;
use crate::logging::LoggingConfig;
use crate::storage::{MemoryStorage, SledStorage, Storage};
use crate::utxo::DEFAULT_UTXO_CACHE_SIZE;

/// Height gap above the tail at which a received block triggers a bulk
/// download instead of fork merging.
pub const DEFAULT_HEIGHT_DIFF_THRESHOLD: u64 = 10;

/// Capacity of the download request channel.
pub const DEFAULT_DOWNLOAD_REQUEST_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Maximum number of candidate blocks kept in the fork pool.
    pub fork_pool_capacity: usize,

    /// Number of per-owner UTXO sets cached in memory.
    pub utxo_cache_capacity: usize,

    pub height_diff_threshold: u64,

    pub download_request_capacity: usize,

    /// Directory of the sled database. In-memory storage when unset.
    pub storage_path: Option<PathBuf>,

    pub logging: LoggingConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            fork_pool_capacity: DEFAULT_FORK_POOL_CAPACITY,
            utxo_cache_capacity: DEFAULT_UTXO_CACHE_SIZE,
            height_diff_threshold: DEFAULT_HEIGHT_DIFF_THRESHOLD,
            download_request_capacity: DEFAULT_DOWNLOAD_REQUEST_CAPACITY,
            storage_path: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Configuration persisting to `storage_path`.
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: Some(storage_path.into()),
            ..Self::default()
        }
    }

    pub fn with_fork_pool_capacity(mut self, capacity: usize) -> Self {
        self.fork_pool_capacity = capacity;
        self
    }

    pub fn with_utxo_cache_capacity(mut self, capacity: usize) -> Self {
        self.utxo_cache_capacity = capacity;
        self
    }

    pub fn with_height_diff_threshold(mut self, threshold: u64) -> Self {
        self.height_diff_threshold = threshold;
        self
    }

    pub fn with_download_request_capacity(mut self, capacity: usize) -> Self {
        self.download_request_capacity = capacity;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Keep everything in memory.
    pub fn in_memory(mut self) -> Self {
        self.storage_path = None;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.fork_pool_capacity == 0 {
            return Err("fork_pool_capacity must be > 0".to_string());
        }
        if self.utxo_cache_capacity == 0 {
            return Err("utxo_cache_capacity must be > 0".to_string());
        }
        if self.height_diff_threshold == 0 {
            return Err("height_diff_threshold must be > 0".to_string());
        }
        if self.download_request_capacity == 0 {
            return Err("download_request_capacity must be > 0".to_string());
        }
        if let Some(file) = &self.logging.file {
            if file.log_dir.as_os_str().is_empty() {
                return Err("log directory must not be empty".to_string());
            }
        }
        Ok(())
    }

    /// Opens the configured storage backend.
    pub fn open_storage(&self) -> StorageResult<Arc<dyn Storage>> {
        match &self.storage_path {
            Some(path) => {
                info!("Opening sled storage at {:?}", path);
                Ok(Arc::new(SledStorage::open(path)?))
            }
            None => Ok(Arc::new(MemoryStorage::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::logging::LogFileConfig;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.fork_pool_capacity, 1024);
        assert_eq!(config.utxo_cache_capacity, 1024);
        assert_eq!(config.height_diff_threshold, 10);
        assert_eq!(config.download_request_capacity, 100);
        assert!(config.storage_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(LedgerConfig::default().with_fork_pool_capacity(0).validate().is_err());
        assert!(LedgerConfig::default().with_utxo_cache_capacity(0).validate().is_err());
        assert!(LedgerConfig::default().with_height_diff_threshold(0).validate().is_err());
        assert!(LedgerConfig::default().with_download_request_capacity(0).validate().is_err());

        let logging = LoggingConfig {
            level: None,
            console: false,
            file: Some(LogFileConfig::new("")),
        };
        assert!(LedgerConfig::default().with_logging(logging).validate().is_err());
    }

    #[test]
    fn test_open_storage_backends() {
        let memory = LedgerConfig::default().open_storage().unwrap();
        memory.put(b"k", b"v").unwrap();
        assert_eq!(memory.get(b"k").unwrap(), Some(b"v".to_vec()));

        let dir = TempDir::new().unwrap();
        let sled = LedgerConfig::new(dir.path().join("db")).open_storage().unwrap();
        sled.put(b"k", b"v").unwrap();
        assert_eq!(sled.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(LedgerConfig::new(dir.path()).in_memory().storage_path.is_none());
    }
}
