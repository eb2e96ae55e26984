// src/durable.rs
// WAL client: wraps logical mutations in atomic units and emits page-change
// records before pages leave their exclusive locks

use std::sync::Arc;

use crate::atomic::AtomicOperationManager;
use crate::error::{BonsaiError, Result};
use crate::page::{PageGuard, TrackMode};
use crate::wal::WalRecord;

pub struct DurableComponent {
    atomic: Arc<AtomicOperationManager>,
    durable_in_non_tx_mode: bool,
}

impl DurableComponent {
    pub fn new(atomic: Arc<AtomicOperationManager>, durable_in_non_tx_mode: bool) -> Self {
        DurableComponent {
            atomic,
            durable_in_non_tx_mode,
        }
    }

    fn wal_enabled(&self) -> bool {
        self.durable_in_non_tx_mode && self.atomic.wal().is_some()
    }

    /// Whether pages touched by this component buffer deltas for the WAL
    pub fn track_mode(&self) -> TrackMode {
        if self.wal_enabled() {
            TrackMode::Full
        } else {
            TrackMode::None
        }
    }

    pub fn start_durable_operation(&self) -> Result<()> {
        if self.wal_enabled() {
            self.atomic.start_atomic_operation()?;
        }
        Ok(())
    }

    pub fn end_durable_operation(&self, rollback: bool) -> Result<()> {
        if self.wal_enabled() {
            self.atomic.end_atomic_operation(rollback)?;
        }
        Ok(())
    }

    /// Emit an UpdatePage record for the page's buffered delta and link it
    /// into the page's undo chain. Must run while the page lock is held.
    pub fn log_page_changes(&self, page: &mut PageGuard, is_new: bool) -> Result<()> {
        if !self.wal_enabled() {
            return Ok(());
        }
        let changes = page.take_changes();
        if changes.is_empty() {
            return Ok(());
        }

        let op = self.atomic.current().ok_or_else(|| {
            BonsaiError::Corruption("page changes outside an atomic operation".to_string())
        })?;
        let wal = match self.atomic.wal() {
            Some(wal) => wal,
            None => return Ok(()),
        };

        // New pages chain back to the unit start; existing pages chain to
        // their previous update record
        let prev_lsn = if is_new {
            Some(op.start_lsn)
        } else {
            match page.lsn() {
                0 => Some(op.start_lsn),
                lsn => Some(lsn),
            }
        };

        let lsn = wal.append(&WalRecord::UpdatePage {
            file_id: page.file_id(),
            page_index: page.page_index(),
            unit_id: op.unit_id,
            prev_lsn,
            changes,
        })?;
        page.set_lsn(lsn);
        Ok(())
    }
}
