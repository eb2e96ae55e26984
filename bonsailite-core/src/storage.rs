// src/storage.rs
// Storage facade: disk cache + WAL + atomic operation manager

use std::path::Path;
use std::sync::Arc;

use crate::atomic::AtomicOperationManager;
use crate::cache::{DiskCache, StorageConfig};
use crate::error::Result;
use crate::wal::{self, WriteAheadLog};

const WAL_FILE_NAME: &str = "storage.wal";

/// Everything a tree needs from its surrounding storage. Opening runs WAL
/// recovery so trees always load from a consistent page state.
pub struct BonsaiStorage {
    cache: DiskCache,
    atomic: Arc<AtomicOperationManager>,
}

impl BonsaiStorage {
    pub fn open(root_dir: impl AsRef<Path>, config: StorageConfig) -> Result<Arc<Self>> {
        let root_dir = root_dir.as_ref();
        let cache = DiskCache::new(root_dir, config)?;

        let wal = Arc::new(WriteAheadLog::open(root_dir.join(WAL_FILE_NAME))?);
        wal::recover(&wal, &cache)?;

        Ok(Arc::new(BonsaiStorage {
            cache,
            atomic: Arc::new(AtomicOperationManager::new(Some(wal))),
        }))
    }

    /// Open without a WAL: mutations are not crash-recoverable
    pub fn open_without_wal(root_dir: impl AsRef<Path>, config: StorageConfig) -> Result<Arc<Self>> {
        let cache = DiskCache::new(root_dir.as_ref(), config)?;
        Ok(Arc::new(BonsaiStorage {
            cache,
            atomic: Arc::new(AtomicOperationManager::new(None)),
        }))
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn atomic(&self) -> &Arc<AtomicOperationManager> {
        &self.atomic
    }

    /// Flush dirty pages to disk
    pub fn flush(&self) -> Result<()> {
        if let Some(wal) = self.atomic.wal() {
            wal.flush()?;
        }
        self.cache.flush_buffer()
    }
}
