// src/wal.rs
// Write-Ahead Log: atomic-unit bracketing records and page-change records

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::cache::{DiskCache, FileId};
use crate::error::{BonsaiError, Result};
use crate::page::{PageDelta, TrackMode};

/// Monotonic log sequence number: the byte offset of a record
pub type Lsn = u64;

/// Identifier of one atomic operation unit
pub type OperationUnitId = u64;

const REC_UNIT_START: u8 = 0x01;
const REC_UNIT_END: u8 = 0x02;
const REC_UPDATE_PAGE: u8 = 0x03;

const WAL_MAGIC: &[u8; 8] = b"BONSWAL\0";
const WAL_VERSION: u32 = 1;

/// Fixed file header; the first record lands at this offset, so an LSN of 0
/// always means "no record"
const WAL_HEADER_SIZE: u64 = 16;

/// A record consumed by the tree writer. All page changes between a unit's
/// Start and End commit or roll back together on recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    AtomicUnitStart {
        compatibility: bool,
        unit_id: OperationUnitId,
    },
    AtomicUnitEnd {
        unit_id: OperationUnitId,
        rollback: bool,
    },
    UpdatePage {
        file_id: FileId,
        page_index: u64,
        unit_id: OperationUnitId,
        prev_lsn: Option<Lsn>,
        changes: Vec<PageDelta>,
    },
}

impl WalRecord {
    fn record_type(&self) -> u8 {
        match self {
            WalRecord::AtomicUnitStart { .. } => REC_UNIT_START,
            WalRecord::AtomicUnitEnd { .. } => REC_UNIT_END,
            WalRecord::UpdatePage { .. } => REC_UPDATE_PAGE,
        }
    }

    fn unit_id(&self) -> OperationUnitId {
        match self {
            WalRecord::AtomicUnitStart { unit_id, .. } => *unit_id,
            WalRecord::AtomicUnitEnd { unit_id, .. } => *unit_id,
            WalRecord::UpdatePage { unit_id, .. } => *unit_id,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            WalRecord::AtomicUnitStart { compatibility, .. } => {
                buf.push(*compatibility as u8);
            }
            WalRecord::AtomicUnitEnd { rollback, .. } => {
                buf.push(*rollback as u8);
            }
            WalRecord::UpdatePage {
                file_id,
                page_index,
                prev_lsn,
                changes,
                ..
            } => {
                buf.extend_from_slice(&file_id.to_le_bytes());
                buf.extend_from_slice(&page_index.to_le_bytes());
                match prev_lsn {
                    Some(lsn) => {
                        buf.push(1);
                        buf.extend_from_slice(&lsn.to_le_bytes());
                    }
                    None => {
                        buf.push(0);
                        buf.extend_from_slice(&0u64.to_le_bytes());
                    }
                }
                buf.extend_from_slice(&(changes.len() as u32).to_le_bytes());
                for change in changes {
                    change.write_to(&mut buf);
                }
            }
        }
        buf
    }

    fn from_parts(record_type: u8, unit_id: OperationUnitId, payload: &[u8]) -> Result<Self> {
        let corrupt = || BonsaiError::WalCorruption;
        match record_type {
            REC_UNIT_START => {
                let compatibility = *payload.first().ok_or_else(corrupt)? != 0;
                Ok(WalRecord::AtomicUnitStart {
                    compatibility,
                    unit_id,
                })
            }
            REC_UNIT_END => {
                let rollback = *payload.first().ok_or_else(corrupt)? != 0;
                Ok(WalRecord::AtomicUnitEnd { unit_id, rollback })
            }
            REC_UPDATE_PAGE => {
                let mut pos = 0;
                let file_id = u32::from_le_bytes(
                    payload
                        .get(pos..pos + 4)
                        .ok_or_else(corrupt)?
                        .try_into()
                        .map_err(|_| corrupt())?,
                );
                pos += 4;
                let page_index = u64::from_le_bytes(
                    payload
                        .get(pos..pos + 8)
                        .ok_or_else(corrupt)?
                        .try_into()
                        .map_err(|_| corrupt())?,
                );
                pos += 8;
                let has_prev = *payload.get(pos).ok_or_else(corrupt)? != 0;
                pos += 1;
                let prev_raw = u64::from_le_bytes(
                    payload
                        .get(pos..pos + 8)
                        .ok_or_else(corrupt)?
                        .try_into()
                        .map_err(|_| corrupt())?,
                );
                pos += 8;
                let count = u32::from_le_bytes(
                    payload
                        .get(pos..pos + 4)
                        .ok_or_else(corrupt)?
                        .try_into()
                        .map_err(|_| corrupt())?,
                ) as usize;
                pos += 4;
                let mut changes = Vec::with_capacity(count);
                for _ in 0..count {
                    changes.push(PageDelta::read_from(payload, &mut pos)?);
                }
                Ok(WalRecord::UpdatePage {
                    file_id,
                    page_index,
                    unit_id,
                    prev_lsn: has_prev.then_some(prev_raw),
                    changes,
                })
            }
            _ => Err(BonsaiError::WalCorruption),
        }
    }
}

fn compute_checksum(record_type: u8, unit_id: OperationUnitId, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(&unit_id.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

struct WalFile {
    file: File,
}

/// Write-Ahead Log file manager. `append` returns the record's LSN.
pub struct WriteAheadLog {
    inner: Mutex<WalFile>,
}

impl WriteAheadLog {
    /// Open or create a WAL file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            write_header(&mut file)?;
        } else {
            let mut header = [0u8; WAL_HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if &header[0..8] != WAL_MAGIC {
                return Err(BonsaiError::WalCorruption);
            }
        }

        Ok(WriteAheadLog {
            inner: Mutex::new(WalFile { file }),
        })
    }

    pub fn append(&self, record: &WalRecord) -> Result<Lsn> {
        let record_type = record.record_type();
        let unit_id = record.unit_id();
        let payload = record.payload();

        let mut buf = Vec::with_capacity(17 + payload.len());
        buf.push(record_type);
        buf.extend_from_slice(&unit_id.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&compute_checksum(record_type, unit_id, &payload).to_le_bytes());

        let mut inner = self.inner.lock();
        let lsn = inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&buf)?;
        Ok(lsn)
    }

    /// Flush WAL to disk (fsync)
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    /// Read every whole record in log order. A torn or corrupt tail record
    /// ends the scan; everything before it is returned.
    pub fn records(&self) -> Result<Vec<(Lsn, WalRecord)>> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;

        let mut records = Vec::new();
        let mut offset: u64 = WAL_HEADER_SIZE;
        loop {
            match read_record(&mut inner.file) {
                Ok(Some((record, consumed))) => {
                    records.push((offset, record));
                    offset += consumed;
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        Ok(records)
    }

    /// Clear WAL file (after successful recovery)
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0)?;
        write_header(&mut inner.file)?;
        Ok(())
    }
}

fn write_header(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(WAL_MAGIC)?;
    file.write_all(&WAL_VERSION.to_le_bytes())?;
    file.write_all(&[0u8; 4])?;
    file.sync_all()?;
    Ok(())
}

fn read_record(file: &mut File) -> Result<Option<(WalRecord, u64)>> {
    // Header: 1 (type) + 8 (unit id) + 4 (payload len)
    let mut header = [0u8; 13];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let record_type = header[0];
    let unit_id = u64::from_le_bytes(header[1..9].try_into().unwrap());
    let payload_len = u32::from_le_bytes(header[9..13].try_into().unwrap()) as usize;

    let mut payload = vec![0u8; payload_len];
    file.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let checksum = u32::from_le_bytes(checksum_bytes);

    if compute_checksum(record_type, unit_id, &payload) != checksum {
        return Err(BonsaiError::WalCorruption);
    }

    let record = WalRecord::from_parts(record_type, unit_id, &payload)?;
    Ok(Some((record, 17 + payload_len as u64)))
}

/// Replay the log against the cache after a crash: repeat history by
/// redoing every whole page-change record in log order, then undo the
/// records of loser units (never closed, or closed with rollback) in
/// reverse order. The WAL is cleared once the replayed pages are flushed.
pub fn recover(wal: &WriteAheadLog, cache: &DiskCache) -> Result<()> {
    let records = wal.records()?;
    if records.is_empty() {
        return Ok(());
    }

    use std::collections::HashMap;
    let mut committed: HashMap<OperationUnitId, bool> = HashMap::new();
    for (_, record) in &records {
        match record {
            WalRecord::AtomicUnitStart { unit_id, .. } => {
                committed.insert(*unit_id, false);
            }
            WalRecord::AtomicUnitEnd { unit_id, rollback } => {
                committed.insert(*unit_id, !rollback);
            }
            WalRecord::UpdatePage { .. } => {}
        }
    }

    // Redo pass: reconstruct the exact crash-time page state
    for (lsn, record) in &records {
        if let WalRecord::UpdatePage {
            file_id,
            page_index,
            changes,
            ..
        } = record
        {
            apply_changes(cache, *file_id, *page_index, changes, *lsn, true)?;
        }
    }

    // Undo pass: roll loser units back, newest change first
    for (lsn, record) in records.iter().rev() {
        if let WalRecord::UpdatePage {
            file_id,
            page_index,
            unit_id,
            changes,
            ..
        } = record
        {
            if !committed.get(unit_id).copied().unwrap_or(false) {
                apply_changes(cache, *file_id, *page_index, changes, *lsn, false)?;
            }
        }
    }

    cache.flush_buffer()?;
    wal.clear()?;
    Ok(())
}

fn apply_changes(
    cache: &DiskCache,
    file_id: FileId,
    page_index: u64,
    changes: &[PageDelta],
    lsn: Lsn,
    redo: bool,
) -> Result<()> {
    // Files deleted after these records were logged are simply gone
    match cache.ensure_open(file_id) {
        Err(BonsaiError::FileNotFound(_)) => return Ok(()),
        other => other?,
    }
    cache.grow_to(file_id, page_index + 1)?;
    let entry = cache.load(file_id, page_index)?;
    let mut page = entry.lock(TrackMode::None);
    for change in changes {
        let image = if redo { &change.new } else { &change.old };
        page.set_bytes(change.offset as usize, image);
    }
    if redo {
        page.set_lsn(lsn);
    }
    entry.mark_dirty();
    Ok(())
}
