// src/cache.rs
// File-backed write-back page cache with per-page exclusive locks

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::error::{BonsaiError, Result};
use crate::page::{PageGuard, TrackMode};

pub type FileId = u32;

/// Storage geometry. The root bucket offset is derived from the bucket size:
/// bonsai nodes occupy the back half of their page, so the first node of a
/// tree starts two bucket regions into the page.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub page_size: usize,
    pub bucket_size: usize,
    pub extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            page_size: 64 * 1024,
            bucket_size: 8 * 1024,
            extension: "bsb".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn root_bucket_offset(&self) -> u32 {
        (2 * self.bucket_size) as u32
    }
}

/// One resident page. The buffer mutex is the page's exclusive lock.
pub struct CacheFrame {
    buffer: Arc<Mutex<Vec<u8>>>,
    dirty: AtomicBool,
}

impl CacheFrame {
    pub(crate) fn new_zeroed(page_size: usize) -> Self {
        CacheFrame {
            buffer: Arc::new(Mutex::new(vec![0u8; page_size])),
            dirty: AtomicBool::new(false),
        }
    }

    fn from_bytes(bytes: Vec<u8>) -> Self {
        CacheFrame {
            buffer: Arc::new(Mutex::new(bytes)),
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock_buffer(&self) -> ArcMutexGuard<RawMutex, Vec<u8>> {
        self.buffer.lock_arc()
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

/// Handle to a cached page returned by `load`/`allocate_new_page`.
/// Dropping the entry releases it; the frame stays resident until its file
/// is truncated, closed or deleted.
pub struct CacheEntry {
    file_id: FileId,
    page_index: u64,
    frame: Arc<CacheFrame>,
}

impl CacheEntry {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_index(&self) -> u64 {
        self.page_index
    }

    pub fn mark_dirty(&self) {
        self.frame.mark_dirty();
    }

    /// Acquire the page's exclusive lock. The returned guard is the only
    /// path to the page bytes; dropping it releases the lock.
    pub fn lock(&self, track: TrackMode) -> PageGuard {
        PageGuard::new(self.file_id, self.page_index, self.frame.clone(), track)
    }
}

struct FileSlot {
    name: String,
    file: Mutex<File>,
    page_count: AtomicU64,
}

/// Name of the sidecar file mapping container names to stable file ids.
/// WAL records reference pages by file id, so ids must survive restarts.
const NAME_ID_MAP: &str = "name_id.map";

/// Page loader shared by every tree in one storage. Pages are read on first
/// access, kept resident, and written back on `flush_buffer`.
pub struct DiskCache {
    config: StorageConfig,
    root_dir: PathBuf,
    files: DashMap<FileId, Arc<FileSlot>>,
    registry: Mutex<std::collections::HashMap<String, FileId>>,
    frames: DashMap<(FileId, u64), Arc<CacheFrame>>,
    next_file_id: AtomicU32,
}

impl DiskCache {
    pub fn new(root_dir: impl Into<PathBuf>, config: StorageConfig) -> Result<Self> {
        if config.root_bucket_offset() as usize + config.bucket_size > config.page_size {
            return Err(BonsaiError::Corruption(format!(
                "bucket size {} does not fit page size {}",
                config.bucket_size, config.page_size
            )));
        }
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;

        let mut registry = std::collections::HashMap::new();
        let mut max_id = 0;
        let map_path = root_dir.join(NAME_ID_MAP);
        if map_path.exists() {
            let content = std::fs::read_to_string(&map_path)?;
            for line in content.lines() {
                let (id, name) = line.split_once('\t').ok_or_else(|| {
                    BonsaiError::Corruption("malformed name id map".to_string())
                })?;
                let id: FileId = id
                    .parse()
                    .map_err(|_| BonsaiError::Corruption("malformed name id map".to_string()))?;
                max_id = max_id.max(id);
                registry.insert(name.to_string(), id);
            }
        }

        Ok(DiskCache {
            config,
            root_dir,
            files: DashMap::new(),
            registry: Mutex::new(registry),
            frames: DashMap::new(),
            next_file_id: AtomicU32::new(max_id + 1),
        })
    }

    fn persist_registry(&self, registry: &std::collections::HashMap<String, FileId>) -> Result<()> {
        let mut content = String::new();
        for (name, id) in registry {
            content.push_str(&format!("{}\t{}\n", id, name));
        }
        std::fs::write(self.root_dir.join(NAME_ID_MAP), content)?;
        Ok(())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn slot(&self, file_id: FileId) -> Result<Arc<FileSlot>> {
        self.files
            .get(&file_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| BonsaiError::FileNotFound(format!("file id {}", file_id)))
    }

    /// Open or create the container file `<name>.<extension>`. The returned
    /// id is stable across restarts via the on-disk name id map.
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        let file_name = format!("{}.{}", name, self.config.extension);

        let file_id = {
            let mut registry = self.registry.lock();
            match registry.get(&file_name) {
                Some(id) => *id,
                None => {
                    let id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                    registry.insert(file_name.clone(), id);
                    self.persist_registry(&registry)?;
                    id
                }
            }
        };
        if self.files.contains_key(&file_id) {
            return Ok(file_id);
        }

        let path = self.root_dir.join(&file_name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let page_count = file.metadata()?.len() / self.config.page_size as u64;

        self.files.insert(
            file_id,
            Arc::new(FileSlot {
                name: file_name,
                file: Mutex::new(file),
                page_count: AtomicU64::new(page_count),
            }),
        );
        Ok(file_id)
    }

    /// Reopen a registered file by its stable id (used by WAL replay, which
    /// sees ids before any tree has opened its container)
    pub fn ensure_open(&self, file_id: FileId) -> Result<()> {
        if self.files.contains_key(&file_id) {
            return Ok(());
        }
        let name = {
            let registry = self.registry.lock();
            registry
                .iter()
                .find(|(_, id)| **id == file_id)
                .map(|(name, _)| name.clone())
        }
        .ok_or_else(|| BonsaiError::FileNotFound(format!("file id {}", file_id)))?;

        let path = self.root_dir.join(&name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let page_count = file.metadata()?.len() / self.config.page_size as u64;
        self.files.insert(
            file_id,
            Arc::new(FileSlot {
                name,
                file: Mutex::new(file),
                page_count: AtomicU64::new(page_count),
            }),
        );
        Ok(())
    }

    /// Extend the logical page range to at least `page_count` pages. Replay
    /// needs this for pages that were allocated but never flushed.
    pub fn grow_to(&self, file_id: FileId, page_count: u64) -> Result<()> {
        let slot = self.slot(file_id)?;
        slot.page_count.fetch_max(page_count, Ordering::AcqRel);
        Ok(())
    }

    pub fn file_name(&self, file_id: FileId) -> Result<String> {
        Ok(self.slot(file_id)?.name.clone())
    }

    pub fn page_count(&self, file_id: FileId) -> Result<u64> {
        Ok(self.slot(file_id)?.page_count.load(Ordering::Acquire))
    }

    /// Append a fresh zeroed page to the file's logical page range
    pub fn allocate_new_page(&self, file_id: FileId) -> Result<CacheEntry> {
        let slot = self.slot(file_id)?;
        let page_index = slot.page_count.fetch_add(1, Ordering::AcqRel);

        let frame = Arc::new(CacheFrame::new_zeroed(self.config.page_size));
        frame.mark_dirty();
        self.frames.insert((file_id, page_index), frame.clone());

        Ok(CacheEntry {
            file_id,
            page_index,
            frame,
        })
    }

    pub fn load(&self, file_id: FileId, page_index: u64) -> Result<CacheEntry> {
        let slot = self.slot(file_id)?;
        if page_index >= slot.page_count.load(Ordering::Acquire) {
            return Err(BonsaiError::Corruption(format!(
                "page {} out of range in '{}'",
                page_index, slot.name
            )));
        }

        if let Some(frame) = self.frames.get(&(file_id, page_index)) {
            let frame = Arc::clone(frame.value());
            return Ok(CacheEntry {
                file_id,
                page_index,
                frame,
            });
        }

        let mut bytes = vec![0u8; self.config.page_size];
        {
            let mut file = slot.file.lock();
            let offset = page_index * self.config.page_size as u64;
            // Pages past EOF were allocated but never flushed; they read as zeros
            if offset < file.metadata()?.len() {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut bytes)?;
            }
        }

        let frame = Arc::clone(
            self.frames
                .entry((file_id, page_index))
                .or_insert_with(|| Arc::new(CacheFrame::from_bytes(bytes)))
                .value(),
        );

        Ok(CacheEntry {
            file_id,
            page_index,
            frame,
        })
    }

    /// Write every dirty frame back to its file and sync. The page table is
    /// snapshotted first so no shard stays locked across file I/O.
    pub fn flush_buffer(&self) -> Result<()> {
        let snapshot: Vec<((FileId, u64), Arc<CacheFrame>)> = self
            .frames
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for ((file_id, page_index), frame) in snapshot {
            if !frame.take_dirty() {
                continue;
            }
            let slot = self.slot(file_id)?;
            let buffer = frame.buffer.lock();
            let mut file = slot.file.lock();
            file.seek(SeekFrom::Start(page_index * self.config.page_size as u64))?;
            file.write_all(&buffer)?;
        }

        let slots: Vec<Arc<FileSlot>> = self.files.iter().map(|s| s.value().clone()).collect();
        for slot in slots {
            slot.file.lock().sync_all()?;
        }
        Ok(())
    }

    fn drop_file_frames(&self, file_id: FileId) {
        self.frames.retain(|(fid, _), _| *fid != file_id);
    }

    pub fn truncate_file(&self, file_id: FileId) -> Result<()> {
        let slot = self.slot(file_id)?;
        self.drop_file_frames(file_id);
        {
            let file = slot.file.lock();
            file.set_len(0)?;
            file.sync_all()?;
        }
        slot.page_count.store(0, Ordering::Release);
        Ok(())
    }

    pub fn close_file(&self, file_id: FileId) -> Result<()> {
        self.flush_buffer()?;
        self.drop_file_frames(file_id);
        self.files.remove(&file_id);
        Ok(())
    }

    pub fn delete_file(&self, file_id: FileId) -> Result<()> {
        let slot = self.slot(file_id)?;
        self.drop_file_frames(file_id);
        self.files.remove(&file_id);
        {
            let mut registry = self.registry.lock();
            registry.remove(&slot.name);
            self.persist_registry(&registry)?;
        }
        std::fs::remove_file(self.root_dir.join(&slot.name))?;
        Ok(())
    }
}
