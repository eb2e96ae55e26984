// src/atomic.rs
// Thread-local nestable atomic operation units

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;

use crate::error::{BonsaiError, Result};
use crate::wal::{Lsn, OperationUnitId, WalRecord, WriteAheadLog};

/// The unit a thread is currently inside. Re-entrant starts on the same
/// thread join the outer unit via the counter.
#[derive(Debug, Clone)]
pub struct AtomicOperation {
    pub unit_id: OperationUnitId,
    pub start_lsn: Lsn,
    counter: u32,
    rollback: bool,
}

/// Issues unit ids and Start/End records. A thread has at most one active
/// unit; different threads' units interleave freely in the log.
pub struct AtomicOperationManager {
    wal: Option<Arc<WriteAheadLog>>,
    unit_counter: AtomicU64,
    active: DashMap<ThreadId, AtomicOperation>,
}

impl AtomicOperationManager {
    pub fn new(wal: Option<Arc<WriteAheadLog>>) -> Self {
        AtomicOperationManager {
            wal,
            unit_counter: AtomicU64::new(0),
            active: DashMap::new(),
        }
    }

    pub fn wal(&self) -> Option<&Arc<WriteAheadLog>> {
        self.wal.as_ref()
    }

    /// Enter (or re-enter) the current thread's atomic unit
    pub fn start_atomic_operation(&self) -> Result<OperationUnitId> {
        let thread_id = thread::current().id();

        if let Some(mut op) = self.active.get_mut(&thread_id) {
            op.counter += 1;
            return Ok(op.unit_id);
        }

        let unit_id = self.unit_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let start_lsn = match &self.wal {
            Some(wal) => wal.append(&WalRecord::AtomicUnitStart {
                compatibility: false,
                unit_id,
            })?,
            None => 0,
        };

        self.active.insert(
            thread_id,
            AtomicOperation {
                unit_id,
                start_lsn,
                counter: 1,
                rollback: false,
            },
        );
        Ok(unit_id)
    }

    /// Leave the current thread's unit. When the outermost frame ends, the
    /// End record is logged and synced. A nested frame that rolled back
    /// surfaces as `Rollback` to the outermost caller that did not ask for
    /// one.
    pub fn end_atomic_operation(&self, rollback: bool) -> Result<()> {
        let thread_id = thread::current().id();
        let mut op = self.active.get_mut(&thread_id).ok_or_else(|| {
            BonsaiError::Corruption("end of atomic operation without start".to_string())
        })?;

        if rollback {
            op.rollback = true;
        }
        op.counter -= 1;

        if op.counter > 0 {
            return Ok(());
        }

        let unit_id = op.unit_id;
        let rolled_back = op.rollback;
        drop(op);
        self.active.remove(&thread_id);

        if let Some(wal) = &self.wal {
            wal.append(&WalRecord::AtomicUnitEnd {
                unit_id,
                rollback: rolled_back,
            })?;
            wal.flush()?;
        }

        if rolled_back && !rollback {
            return Err(BonsaiError::Rollback);
        }
        Ok(())
    }

    /// The current thread's unit, if any
    pub fn current(&self) -> Option<AtomicOperation> {
        self.active.get(&thread::current().id()).map(|op| op.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager_with_wal() -> (TempDir, AtomicOperationManager) {
        let temp_dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(temp_dir.path().join("test.wal")).unwrap();
        (temp_dir, AtomicOperationManager::new(Some(Arc::new(wal))))
    }

    #[test]
    fn test_nested_starts_share_one_unit() {
        let (_temp, manager) = manager_with_wal();

        let outer = manager.start_atomic_operation().unwrap();
        let inner = manager.start_atomic_operation().unwrap();
        assert_eq!(outer, inner);

        manager.end_atomic_operation(false).unwrap();
        assert!(manager.current().is_some());
        manager.end_atomic_operation(false).unwrap();
        assert!(manager.current().is_none());

        let records: Vec<_> = manager.wal().unwrap().records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(
            records[1].1,
            WalRecord::AtomicUnitEnd {
                rollback: false,
                ..
            }
        ));
    }

    #[test]
    fn test_fresh_units_get_distinct_ids() {
        let (_temp, manager) = manager_with_wal();

        let first = manager.start_atomic_operation().unwrap();
        manager.end_atomic_operation(false).unwrap();
        let second = manager.start_atomic_operation().unwrap();
        manager.end_atomic_operation(false).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_nested_rollback_surfaces_at_outermost_end() {
        let (_temp, manager) = manager_with_wal();

        manager.start_atomic_operation().unwrap();
        manager.start_atomic_operation().unwrap();

        // Inner frame rolls back; the outer caller did not ask for it
        manager.end_atomic_operation(true).unwrap();
        let result = manager.end_atomic_operation(false);

        assert!(matches!(result, Err(BonsaiError::Rollback)));

        let records = manager.wal().unwrap().records().unwrap();
        assert!(matches!(
            records.last().unwrap().1,
            WalRecord::AtomicUnitEnd { rollback: true, .. }
        ));
    }

    #[test]
    fn test_end_without_start_is_corruption() {
        let (_temp, manager) = manager_with_wal();
        assert!(matches!(
            manager.end_atomic_operation(false),
            Err(BonsaiError::Corruption(_))
        ));
    }

    #[test]
    fn test_without_wal_units_still_nest() {
        let manager = AtomicOperationManager::new(None);

        manager.start_atomic_operation().unwrap();
        manager.start_atomic_operation().unwrap();
        manager.end_atomic_operation(false).unwrap();
        manager.end_atomic_operation(false).unwrap();

        assert!(manager.current().is_none());
    }
}
