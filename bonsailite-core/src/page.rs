// src/page.rs
// Exclusive page access with buffered change tracking for the WAL

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use std::sync::Arc;

use crate::cache::{CacheFrame, FileId};
use crate::error::{BonsaiError, Result};

/// Offset of the page's last-stored LSN inside the page header
const PAGE_LSN_OFFSET: usize = 0;

/// Whether page writes buffer a delta for the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackMode {
    Full,
    None,
}

/// One contiguous before/after image inside a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDelta {
    pub offset: u32,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

impl PageDelta {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&(self.old.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.old);
        buf.extend_from_slice(&self.new);
    }

    pub fn read_from(data: &[u8], pos: &mut usize) -> Result<Self> {
        let corrupt = || BonsaiError::WalCorruption;
        let offset = u32::from_le_bytes(
            data.get(*pos..*pos + 4)
                .ok_or_else(corrupt)?
                .try_into()
                .map_err(|_| corrupt())?,
        );
        *pos += 4;
        let len = u32::from_le_bytes(
            data.get(*pos..*pos + 4)
                .ok_or_else(corrupt)?
                .try_into()
                .map_err(|_| corrupt())?,
        ) as usize;
        *pos += 4;
        let old = data.get(*pos..*pos + len).ok_or_else(corrupt)?.to_vec();
        *pos += len;
        let new = data.get(*pos..*pos + len).ok_or_else(corrupt)?.to_vec();
        *pos += len;
        Ok(PageDelta { offset, old, new })
    }
}

/// Exclusive lock over one cached page. All byte access during tree
/// operations goes through this guard; in `TrackMode::Full` every write
/// buffers a before/after delta until `take_changes` drains it for the WAL.
pub struct PageGuard {
    file_id: FileId,
    page_index: u64,
    frame: Arc<CacheFrame>,
    buf: ArcMutexGuard<RawMutex, Vec<u8>>,
    track: TrackMode,
    changes: Vec<PageDelta>,
}

impl PageGuard {
    pub(crate) fn new(
        file_id: FileId,
        page_index: u64,
        frame: Arc<CacheFrame>,
        track: TrackMode,
    ) -> Self {
        let buf = frame.lock_buffer();
        PageGuard {
            file_id,
            page_index,
            frame,
            buf,
            track,
            changes: Vec::new(),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_index(&self) -> u64 {
        self.page_index
    }

    pub fn track_mode(&self) -> TrackMode {
        self.track
    }

    pub fn mark_dirty(&self) {
        self.frame.mark_dirty();
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[offset..offset + len]
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.buf[offset]
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.buf[offset..offset + 2].try_into().unwrap())
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap())
    }

    pub fn get_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.buf[offset..offset + 8].try_into().unwrap())
    }

    pub fn get_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.buf[offset..offset + 8].try_into().unwrap())
    }

    pub fn set_bytes(&mut self, offset: usize, data: &[u8]) {
        if self.track == TrackMode::Full && !data.is_empty() {
            self.changes.push(PageDelta {
                offset: offset as u32,
                old: self.buf[offset..offset + data.len()].to_vec(),
                new: data.to_vec(),
            });
        }
        self.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) {
        self.set_bytes(offset, &[value]);
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) {
        self.set_bytes(offset, &value.to_le_bytes());
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        self.set_bytes(offset, &value.to_le_bytes());
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) {
        self.set_bytes(offset, &value.to_le_bytes());
    }

    pub fn set_i64(&mut self, offset: usize, value: i64) {
        self.set_bytes(offset, &value.to_le_bytes());
    }

    /// Move `len` bytes from `src` to `dst` within the page
    pub fn move_bytes(&mut self, src: usize, dst: usize, len: usize) {
        if src == dst || len == 0 {
            return;
        }
        let data = self.buf[src..src + len].to_vec();
        self.set_bytes(dst, &data);
    }

    /// The page's last-stored WAL record offset. Not part of the tracked
    /// delta; the WAL writer updates it after logging.
    pub fn lsn(&self) -> u64 {
        self.get_u64(PAGE_LSN_OFFSET)
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        let bytes = lsn.to_le_bytes();
        self.buf[PAGE_LSN_OFFSET..PAGE_LSN_OFFSET + 8].copy_from_slice(&bytes);
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Drain the buffered delta for an UpdatePage record
    pub fn take_changes(&mut self) -> Vec<PageDelta> {
        std::mem::take(&mut self.changes)
    }
}
