// src/tree.rs
// The Bonsai B+ tree: an ordered map whose nodes are sub-regions of shared
// pages, so thousands of small trees can coexist in one container file.
//
// The root pointer is stable for the tree's lifetime: a root split rewrites
// the root page in place as an internal node over two freshly allocated
// children. Deletion never merges; leaves keep their slots.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::bucket::{Bucket, BucketEntry, BucketPointer, InternalEntry, LeafEntry};
use crate::cache::{CacheEntry, FileId};
use crate::codec::{ValueCodec, COMPOSITE_KEY_CODEC_ID};
use crate::durable::DurableComponent;
use crate::error::{BonsaiError, Result};
use crate::key::{BonsaiKey, PartialSearchMode};
use crate::page::{PageGuard, TrackMode};
use crate::storage::BonsaiStorage;

/// Result of a root-to-leaf descent. `item_index` is non-negative for an
/// exact match, otherwise `-(insertion index) - 1` in the leaf at the path
/// tail.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub item_index: i32,
    pub path: Vec<BucketPointer>,
}

impl SearchResult {
    fn bucket(&self) -> BucketPointer {
        *self.path.last().expect("search path is never empty")
    }
}

struct TreeState {
    file_id: FileId,
    root: BucketPointer,
    open: bool,
}

/// Durable ordered map rooted at a stable `(page, offset)` pointer.
///
/// Reads take the tree's shared lock, mutations the exclusive lock; every
/// mutation runs inside an atomic operation unit so it commits or rolls
/// back as a whole on recovery.
pub struct BonsaiTree<V, C>
where
    C: ValueCodec<V>,
{
    name: String,
    key_size: usize,
    storage: Arc<BonsaiStorage>,
    durable: DurableComponent,
    codec: C,
    state: RwLock<TreeState>,
    _marker: PhantomData<fn() -> V>,
}

impl<V, C> BonsaiTree<V, C>
where
    C: ValueCodec<V>,
{
    /// Create a fresh tree: allocates the root page and formats an empty
    /// leaf root at the conventional offset.
    pub fn create(
        name: &str,
        root_page_index: u64,
        key_size: usize,
        codec: C,
        storage: Arc<BonsaiStorage>,
    ) -> Result<Self> {
        let file_id = storage.cache().open_file(name)?;
        let durable = DurableComponent::new(storage.atomic().clone(), true);
        let root_offset = storage.cache().config().root_bucket_offset();
        let bucket_size = storage.cache().config().bucket_size;

        durable.start_durable_operation()?;
        let created = (|| -> Result<BucketPointer> {
            let entry = storage.cache().allocate_new_page(file_id)?;
            if entry.page_index() != root_page_index {
                return Err(BonsaiError::Corruption(format!(
                    "root page allocated at {} instead of {}",
                    entry.page_index(),
                    root_page_index
                )));
            }
            let mut page = entry.lock(durable.track_mode());
            let mut bucket = Bucket::init(&mut page, root_offset, bucket_size, true);
            bucket.set_key_serializer_id(COMPOSITE_KEY_CODEC_ID);
            bucket.set_value_serializer_id(codec.id());
            durable.log_page_changes(&mut page, true)?;
            entry.mark_dirty();
            Ok(BucketPointer::new(entry.page_index() as i64, root_offset))
        })();

        match created {
            Ok(root) => {
                durable.end_durable_operation(false)?;
                Ok(BonsaiTree {
                    name: name.to_string(),
                    key_size,
                    storage,
                    durable,
                    codec,
                    state: RwLock::new(TreeState {
                        file_id,
                        root,
                        open: true,
                    }),
                    _marker: PhantomData,
                })
            }
            Err(e) => {
                let _ = durable.end_durable_operation(true);
                Err(e.in_tree(name, None))
            }
        }
    }

    /// Load an existing tree from its root pointer, checking that the
    /// stored codec ids match the ones supplied.
    pub fn load(
        name: &str,
        root: BucketPointer,
        key_size: usize,
        codec: C,
        storage: Arc<BonsaiStorage>,
    ) -> Result<Self> {
        let file_id = storage.cache().open_file(name)?;
        let bucket_size = storage.cache().config().bucket_size;

        {
            let entry = storage.cache().load(file_id, root.page_index as u64)?;
            let mut page = entry.lock(TrackMode::None);
            let bucket = Bucket::attach(&mut page, root.page_offset, bucket_size);
            if bucket.key_serializer_id() != COMPOSITE_KEY_CODEC_ID
                || bucket.value_serializer_id() != codec.id()
            {
                return Err(BonsaiError::Corruption(format!(
                    "codec mismatch in root of '{}': stored ({}, {})",
                    name,
                    bucket.key_serializer_id(),
                    bucket.value_serializer_id()
                )));
            }
        }

        let durable = DurableComponent::new(storage.atomic().clone(), true);
        Ok(BonsaiTree {
            name: name.to_string(),
            key_size,
            storage,
            durable,
            codec,
            state: RwLock::new(TreeState {
                file_id,
                root,
                open: true,
            }),
            _marker: PhantomData,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn root_bucket_pointer(&self) -> BucketPointer {
        self.state.read().root
    }

    fn bucket_size(&self) -> usize {
        self.storage.cache().config().bucket_size
    }

    fn root_offset(&self) -> u32 {
        self.storage.cache().config().root_bucket_offset()
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, TreeState>> {
        let state = self.state.read();
        if !state.open {
            return Err(BonsaiError::TreeClosed(self.name.clone()));
        }
        Ok(state)
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, TreeState>> {
        let state = self.state.write();
        if !state.open {
            return Err(BonsaiError::TreeClosed(self.name.clone()));
        }
        Ok(state)
    }

    fn lock_bucket_page(
        &self,
        state: &TreeState,
        pointer: BucketPointer,
        track: TrackMode,
    ) -> Result<(CacheEntry, PageGuard)> {
        let entry = self
            .storage
            .cache()
            .load(state.file_id, pointer.page_index as u64)?;
        let guard = entry.lock(track);
        Ok((entry, guard))
    }

    fn check_key(&self, key: &BonsaiKey) -> Result<()> {
        if key.sentinel().is_some() {
            return Err(BonsaiError::InvalidKey(
                "boundary keys cannot be stored".to_string(),
            ));
        }
        if key.parts().len() != self.key_size {
            return Err(BonsaiError::InvalidKey(format!(
                "expected {} key parts, got {}",
                self.key_size,
                key.parts().len()
            )));
        }
        Ok(())
    }

    // ---- search ----

    fn find_bucket(
        &self,
        state: &TreeState,
        key: &BonsaiKey,
        mode: PartialSearchMode,
    ) -> Result<SearchResult> {
        let search_key = key.pad(self.key_size, mode);
        let bucket_size = self.bucket_size();

        let mut path = Vec::new();
        let mut pointer = state.root;
        loop {
            path.push(pointer);
            let (_entry, mut page) = self.lock_bucket_page(state, pointer, TrackMode::None)?;
            let bucket = Bucket::attach(&mut page, pointer.page_offset, bucket_size);

            let index = bucket.find(&search_key)?;
            if bucket.is_leaf() {
                return Ok(SearchResult {
                    item_index: index,
                    path,
                });
            }

            if bucket.is_empty() {
                return Err(BonsaiError::Corruption(
                    "empty internal node on search path".to_string(),
                ));
            }

            let child_entry = if index >= 0 {
                match bucket.get_entry(index as usize)? {
                    BucketEntry::Internal(e) => e.right,
                    _ => unreachable!("non-leaf bucket yielded leaf entry"),
                }
            } else {
                let insertion = (-index - 1) as usize;
                if insertion >= bucket.size() {
                    match bucket.get_entry(bucket.size() - 1)? {
                        BucketEntry::Internal(e) => e.right,
                        _ => unreachable!("non-leaf bucket yielded leaf entry"),
                    }
                } else {
                    match bucket.get_entry(insertion)? {
                        BucketEntry::Internal(e) => e.left,
                        _ => unreachable!("non-leaf bucket yielded leaf entry"),
                    }
                }
            };
            pointer = child_entry;
        }
    }

    // ---- point reads ----

    pub fn get(&self, key: &BonsaiKey) -> Result<Option<V>> {
        let state = self.read_state()?;
        self.get_inner(&state, key)
            .map_err(|e| e.in_tree(&self.name, Some(format!("{:?}", key))))
    }

    fn get_inner(&self, state: &TreeState, key: &BonsaiKey) -> Result<Option<V>> {
        self.check_key(key)?;
        let search = self.find_bucket(state, key, PartialSearchMode::None)?;
        if search.item_index < 0 {
            return Ok(None);
        }

        let pointer = search.bucket();
        let (_entry, mut page) = self.lock_bucket_page(state, pointer, TrackMode::None)?;
        let bucket = Bucket::attach(&mut page, pointer.page_offset, self.bucket_size());
        match bucket.get_entry(search.item_index as usize)? {
            BucketEntry::Leaf(e) => Ok(Some(self.codec.decode(&e.value)?)),
            _ => Err(BonsaiError::Corruption(
                "search path ended in internal node".to_string(),
            )),
        }
    }

    pub fn size(&self) -> Result<u64> {
        let state = self.read_state()?;
        let (_entry, mut page) = self.lock_bucket_page(&state, state.root, TrackMode::None)?;
        let bucket = Bucket::attach(&mut page, state.root.page_offset, self.bucket_size());
        Ok(bucket.tree_size())
    }

    // ---- put ----

    pub fn put(&self, key: BonsaiKey, value: &V) -> Result<()> {
        let state = self.write_state()?;
        self.durable
            .start_durable_operation()
            .map_err(|e| e.in_tree(&self.name, None))?;

        match self.put_inner(&state, &key, value) {
            Ok(()) => self
                .durable
                .end_durable_operation(false)
                .map_err(|e| e.in_tree(&self.name, Some(format!("{:?}", key)))),
            Err(e) => {
                // The rollback's own failure must not mask the first error
                let _ = self.durable.end_durable_operation(true);
                Err(e.in_tree(&self.name, Some(format!("{:?}", key))))
            }
        }
    }

    fn put_inner(&self, state: &TreeState, key: &BonsaiKey, value: &V) -> Result<()> {
        self.check_key(key)?;
        let value_bytes = self.codec.encode(value)?;

        let key_len = key.to_bytes()?.len();
        let payload_bound = key_len + value_bytes.len() + 6;
        if payload_bound > Bucket::max_entry_payload(self.bucket_size()) {
            return Err(BonsaiError::Serialization(
                "entry does not fit in an empty bucket".to_string(),
            ));
        }
        // An internal node must be able to hold at least two separators
        if 2 * (key_len + 34) > Bucket::max_entry_payload(self.bucket_size()) {
            return Err(BonsaiError::InvalidKey(
                "key too large for bucket geometry".to_string(),
            ));
        }

        let mut search = self.find_bucket(state, key, PartialSearchMode::None)?;
        let inserted = loop {
            let pointer = search.bucket();
            let (entry, mut page) =
                self.lock_bucket_page(state, pointer, self.durable.track_mode())?;
            let mut bucket = Bucket::attach(&mut page, pointer.page_offset, self.bucket_size());

            let apply = |bucket: &mut Bucket<'_>| -> Result<Option<bool>> {
                if search.item_index >= 0 {
                    if bucket.update_value(search.item_index as usize, &value_bytes)? {
                        Ok(Some(false))
                    } else {
                        Ok(None)
                    }
                } else {
                    let insertion = (-search.item_index - 1) as usize;
                    let leaf_entry = BucketEntry::Leaf(LeafEntry {
                        key: key.clone(),
                        value: value_bytes.clone(),
                    });
                    if bucket.add_entry(insertion, &leaf_entry, true)? {
                        Ok(Some(true))
                    } else {
                        Ok(None)
                    }
                }
            };

            let mut done = apply(&mut bucket)?;
            if done.is_none() {
                // Reclaim abandoned payload space before resorting to a split
                bucket.shrink(bucket.size())?;
                done = apply(&mut bucket)?;
            }
            if done.is_none() && search.item_index >= 0 && bucket.size() == 1 {
                // A lone entry whose grown value cannot coexist with its old
                // payload: rebuild the bucket around the new entry
                bucket.remove(0);
                bucket.shrink(0)?;
                if !bucket.add_entry(
                    0,
                    &BucketEntry::Leaf(LeafEntry {
                        key: key.clone(),
                        value: value_bytes.clone(),
                    }),
                    true,
                )? {
                    return Err(BonsaiError::Corruption(
                        "entry rejected by an empty bucket".to_string(),
                    ));
                }
                done = Some(false);
            }

            if let Some(added) = done {
                self.durable.log_page_changes(&mut page, false)?;
                entry.mark_dirty();
                break added;
            }

            drop(page);
            search = self.split_bucket(state, &search.path, key)?;
        };

        if inserted {
            self.update_tree_size(state, 1)?;
        }
        Ok(())
    }

    fn update_tree_size(&self, state: &TreeState, delta: i64) -> Result<()> {
        let (entry, mut page) =
            self.lock_bucket_page(state, state.root, self.durable.track_mode())?;
        let mut bucket = Bucket::attach(&mut page, state.root.page_offset, self.bucket_size());
        let size = bucket.tree_size() as i64 + delta;
        bucket.set_tree_size(size as u64);
        self.durable.log_page_changes(&mut page, false)?;
        entry.mark_dirty();
        Ok(())
    }

    // ---- split ----

    /// Split the node at the path tail. Returns a fresh search result for
    /// `key` in whichever half it now belongs to; the caller re-runs its
    /// insertion against that bucket.
    fn split_bucket(
        &self,
        state: &TreeState,
        path: &[BucketPointer],
        key: &BonsaiKey,
    ) -> Result<SearchResult> {
        let bucket_size = self.bucket_size();
        let pointer = *path.last().expect("split of empty path");

        let (entry, mut page) = self.lock_bucket_page(state, pointer, self.durable.track_mode())?;

        let (separator, right_entries, is_leaf, middle) = {
            let bucket = Bucket::attach(&mut page, pointer.page_offset, bucket_size);
            let n = bucket.size();
            let middle = n >> 1;
            let separator = bucket.get_key(middle)?;
            let is_leaf = bucket.is_leaf();
            // For internal nodes the separator is promoted, not duplicated
            let start_right = if is_leaf { middle } else { middle + 1 };
            let mut right_entries = Vec::with_capacity(n - start_right);
            for i in start_right..n {
                right_entries.push(bucket.get_entry(i)?);
            }
            (separator, right_entries, is_leaf, middle)
        };

        if path.len() > 1 {
            self.split_non_root(
                state, path, pointer, entry, page, separator, right_entries, is_leaf, middle, key,
            )
        } else {
            self.split_root(
                state, pointer, entry, page, separator, right_entries, is_leaf, middle, key,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_non_root(
        &self,
        state: &TreeState,
        path: &[BucketPointer],
        pointer: BucketPointer,
        entry: CacheEntry,
        mut page: PageGuard,
        separator: BonsaiKey,
        right_entries: Vec<BucketEntry>,
        is_leaf: bool,
        middle: usize,
        key: &BonsaiKey,
    ) -> Result<SearchResult> {
        let bucket_size = self.bucket_size();
        let root_offset = self.root_offset();

        // One new page; its bucket takes the conventional offset
        let new_entry = self.storage.cache().allocate_new_page(state.file_id)?;
        let new_pointer = BucketPointer::new(new_entry.page_index() as i64, root_offset);
        let mut new_page = new_entry.lock(self.durable.track_mode());

        {
            let mut new_bucket = Bucket::init(&mut new_page, root_offset, bucket_size, is_leaf);
            new_bucket.add_all(&right_entries)?;

            let mut bucket = Bucket::attach(&mut page, pointer.page_offset, bucket_size);
            bucket.shrink(middle)?;

            if is_leaf {
                // Splice the new bucket into the sibling list
                let old_right = bucket.right_sibling();
                let mut new_bucket = Bucket::attach(&mut new_page, root_offset, bucket_size);
                new_bucket.set_right_sibling(old_right);
                new_bucket.set_left_sibling(pointer);
                let mut bucket = Bucket::attach(&mut page, pointer.page_offset, bucket_size);
                bucket.set_right_sibling(new_pointer);

                if old_right.is_valid() {
                    let (neighbor_entry, mut neighbor_page) =
                        self.lock_bucket_page(state, old_right, self.durable.track_mode())?;
                    let mut neighbor =
                        Bucket::attach(&mut neighbor_page, old_right.page_offset, bucket_size);
                    neighbor.set_left_sibling(new_pointer);
                    self.durable.log_page_changes(&mut neighbor_page, false)?;
                    neighbor_entry.mark_dirty();
                }
            }
        }

        self.durable.log_page_changes(&mut new_page, true)?;
        new_entry.mark_dirty();
        drop(new_page);
        self.durable.log_page_changes(&mut page, false)?;
        entry.mark_dirty();
        drop(page);

        // Link the separator into the parent, splitting upward as needed
        let parent_path = &path[..path.len() - 1];
        let separator_entry = BucketEntry::Internal(InternalEntry {
            left: pointer,
            right: new_pointer,
            key: separator.clone(),
        });

        let parent_pointer = *parent_path.last().expect("non-root split has a parent");
        let fitted = {
            let (parent_entry, mut parent_page) =
                self.lock_bucket_page(state, parent_pointer, self.durable.track_mode())?;
            let mut parent = Bucket::attach(&mut parent_page, parent_pointer.page_offset, bucket_size);
            let index = parent.find(&separator)?;
            if index >= 0 {
                return Err(BonsaiError::Corruption(
                    "separator key already present in parent".to_string(),
                ));
            }
            let insertion = (-index - 1) as usize;
            let fitted = parent.add_entry(insertion, &separator_entry, true)?;
            if fitted {
                self.durable.log_page_changes(&mut parent_page, false)?;
                parent_entry.mark_dirty();
            }
            fitted
        };

        let new_parent_path = if fitted {
            parent_path.to_vec()
        } else {
            // Parent overflow: split it and re-read its state from the
            // returned search result before inserting the separator
            let parent_result = self.split_bucket(state, parent_path, &separator)?;
            if parent_result.item_index >= 0 {
                return Err(BonsaiError::Corruption(
                    "separator key already present in split parent".to_string(),
                ));
            }
            let target = parent_result.bucket();
            let insertion = (-parent_result.item_index - 1) as usize;
            let (parent_entry, mut parent_page) =
                self.lock_bucket_page(state, target, self.durable.track_mode())?;
            let mut parent = Bucket::attach(&mut parent_page, target.page_offset, bucket_size);
            if !parent.add_entry(insertion, &separator_entry, true)? {
                return Err(BonsaiError::Corruption(
                    "no room for separator after parent split".to_string(),
                ));
            }
            self.durable.log_page_changes(&mut parent_page, false)?;
            parent_entry.mark_dirty();
            parent_result.path
        };

        self.descend_after_split(
            state,
            new_parent_path,
            pointer,
            new_pointer,
            &separator,
            key,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn split_root(
        &self,
        state: &TreeState,
        pointer: BucketPointer,
        entry: CacheEntry,
        mut page: PageGuard,
        separator: BonsaiKey,
        right_entries: Vec<BucketEntry>,
        is_leaf: bool,
        middle: usize,
        key: &BonsaiKey,
    ) -> Result<SearchResult> {
        let bucket_size = self.bucket_size();
        let root_offset = self.root_offset();

        let mut left_entries = Vec::with_capacity(middle);
        {
            let bucket = Bucket::attach(&mut page, pointer.page_offset, bucket_size);
            for i in 0..middle {
                left_entries.push(bucket.get_entry(i)?);
            }
        }

        // The root pointer must not change: both halves move to new pages
        // and the root page is rewritten in place as an internal node.
        let left_cache = self.storage.cache().allocate_new_page(state.file_id)?;
        let left_pointer = BucketPointer::new(left_cache.page_index() as i64, root_offset);
        let right_cache = self.storage.cache().allocate_new_page(state.file_id)?;
        let right_pointer = BucketPointer::new(right_cache.page_index() as i64, root_offset);

        {
            let mut left_page = left_cache.lock(self.durable.track_mode());
            let mut left_bucket = Bucket::init(&mut left_page, root_offset, bucket_size, is_leaf);
            left_bucket.add_all(&left_entries)?;
            if is_leaf {
                left_bucket.set_right_sibling(right_pointer);
            }
            self.durable.log_page_changes(&mut left_page, true)?;
            left_cache.mark_dirty();
        }
        {
            let mut right_page = right_cache.lock(self.durable.track_mode());
            let mut right_bucket = Bucket::init(&mut right_page, root_offset, bucket_size, is_leaf);
            right_bucket.add_all(&right_entries)?;
            if is_leaf {
                right_bucket.set_left_sibling(left_pointer);
            }
            self.durable.log_page_changes(&mut right_page, true)?;
            right_cache.mark_dirty();
        }

        {
            let mut root = Bucket::attach(&mut page, pointer.page_offset, bucket_size);
            root.convert_to_internal();
            if !root.add_entry(
                0,
                &BucketEntry::Internal(InternalEntry {
                    left: left_pointer,
                    right: right_pointer,
                    key: separator.clone(),
                }),
                true,
            )? {
                return Err(BonsaiError::Corruption(
                    "rewritten root cannot hold its single entry".to_string(),
                ));
            }
        }
        self.durable.log_page_changes(&mut page, false)?;
        entry.mark_dirty();
        drop(page);

        self.descend_after_split(
            state,
            vec![pointer],
            left_pointer,
            right_pointer,
            &separator,
            key,
        )
    }

    /// Pick the half the key belongs to and re-search it, so the caller gets
    /// a fresh item index instead of one cached across the split.
    fn descend_after_split(
        &self,
        state: &TreeState,
        parent_path: Vec<BucketPointer>,
        left: BucketPointer,
        right: BucketPointer,
        separator: &BonsaiKey,
        key: &BonsaiKey,
    ) -> Result<SearchResult> {
        let chosen = if key < separator { left } else { right };

        let (_entry, mut page) = self.lock_bucket_page(state, chosen, TrackMode::None)?;
        let bucket = Bucket::attach(&mut page, chosen.page_offset, self.bucket_size());
        let item_index = bucket.find(key)?;

        let mut path = parent_path;
        path.push(chosen);
        Ok(SearchResult { item_index, path })
    }

    // ---- remove ----

    pub fn remove(&self, key: &BonsaiKey) -> Result<Option<V>> {
        let state = self.write_state()?;
        self.durable
            .start_durable_operation()
            .map_err(|e| e.in_tree(&self.name, None))?;

        match self.remove_inner(&state, key) {
            Ok(removed) => {
                self.durable
                    .end_durable_operation(false)
                    .map_err(|e| e.in_tree(&self.name, Some(format!("{:?}", key))))?;
                Ok(removed)
            }
            Err(e) => {
                let _ = self.durable.end_durable_operation(true);
                Err(e.in_tree(&self.name, Some(format!("{:?}", key))))
            }
        }
    }

    fn remove_inner(&self, state: &TreeState, key: &BonsaiKey) -> Result<Option<V>> {
        self.check_key(key)?;
        let search = self.find_bucket(state, key, PartialSearchMode::None)?;
        if search.item_index < 0 {
            return Ok(None);
        }

        let pointer = search.bucket();
        let value = {
            let (entry, mut page) =
                self.lock_bucket_page(state, pointer, self.durable.track_mode())?;
            let mut bucket = Bucket::attach(&mut page, pointer.page_offset, self.bucket_size());
            let value = match bucket.get_entry(search.item_index as usize)? {
                BucketEntry::Leaf(e) => e.value,
                _ => {
                    return Err(BonsaiError::Corruption(
                        "search path ended in internal node".to_string(),
                    ))
                }
            };
            bucket.remove(search.item_index as usize);
            self.durable.log_page_changes(&mut page, false)?;
            entry.mark_dirty();
            value
        };

        // The size decrement belongs to the same atomic unit as the removal
        self.update_tree_size(state, -1)?;
        Ok(Some(self.codec.decode(&value)?))
    }

    // ---- first / last ----

    pub fn first_key(&self) -> Result<Option<BonsaiKey>> {
        let state = self.read_state()?;
        self.edge_key(&state, true)
            .map_err(|e| e.in_tree(&self.name, None))
    }

    pub fn last_key(&self) -> Result<Option<BonsaiKey>> {
        let state = self.read_state()?;
        self.edge_key(&state, false)
            .map_err(|e| e.in_tree(&self.name, None))
    }

    /// Walk toward the leftmost (or rightmost) non-empty leaf, backtracking
    /// through the stack when a leaf turns out empty.
    fn edge_key(&self, state: &TreeState, leftmost: bool) -> Result<Option<BonsaiKey>> {
        let bucket_size = self.bucket_size();
        // (bucket, index of the next child slot to try)
        let mut stack: Vec<(BucketPointer, usize)> = vec![(state.root, 0)];

        while let Some((pointer, child_slot)) = stack.pop() {
            let (_entry, mut page) = self.lock_bucket_page(state, pointer, TrackMode::None)?;
            let bucket = Bucket::attach(&mut page, pointer.page_offset, bucket_size);

            if bucket.is_leaf() {
                if !bucket.is_empty() {
                    let index = if leftmost { 0 } else { bucket.size() - 1 };
                    return Ok(Some(bucket.get_key(index)?));
                }
                continue;
            }

            // An internal node over n entries has n + 1 child slots
            let slots = bucket.size() + 1;
            if child_slot >= slots {
                continue;
            }
            stack.push((pointer, child_slot + 1));

            let ordinal = if leftmost {
                child_slot
            } else {
                slots - 1 - child_slot
            };
            let child = if ordinal == 0 {
                match bucket.get_entry(0)? {
                    BucketEntry::Internal(e) => e.left,
                    _ => unreachable!("non-leaf bucket yielded leaf entry"),
                }
            } else {
                match bucket.get_entry(ordinal - 1)? {
                    BucketEntry::Internal(e) => e.right,
                    _ => unreachable!("non-leaf bucket yielded leaf entry"),
                }
            };
            stack.push((child, 0));
        }
        Ok(None)
    }

    // ---- range scans ----

    /// Feed entries with keys below `key` to the listener, descending.
    /// The listener returning false stops the scan.
    pub fn load_entries_minor<F>(
        &self,
        key: &BonsaiKey,
        inclusive: bool,
        mut listener: F,
    ) -> Result<()>
    where
        F: FnMut(&BonsaiKey, V) -> bool,
    {
        let state = self.read_state()?;
        self.load_entries_minor_inner(&state, key, inclusive, &mut listener)
            .map_err(|e| e.in_tree(&self.name, Some(format!("{:?}", key))))
    }

    fn load_entries_minor_inner(
        &self,
        state: &TreeState,
        key: &BonsaiKey,
        inclusive: bool,
        listener: &mut dyn FnMut(&BonsaiKey, V) -> bool,
    ) -> Result<()> {
        let mode = if inclusive {
            PartialSearchMode::HighestBoundary
        } else {
            PartialSearchMode::LowestBoundary
        };
        let search = self.find_bucket(state, key, mode)?;

        let mut pointer = search.bucket();
        let mut start: i64 = if search.item_index >= 0 {
            if inclusive {
                search.item_index as i64
            } else {
                search.item_index as i64 - 1
            }
        } else {
            (-search.item_index - 1) as i64 - 1
        };

        loop {
            let next = {
                let (_entry, mut page) = self.lock_bucket_page(state, pointer, TrackMode::None)?;
                let bucket = Bucket::attach(&mut page, pointer.page_offset, self.bucket_size());
                let mut index = start.min(bucket.size() as i64 - 1);
                while index >= 0 {
                    match bucket.get_entry(index as usize)? {
                        BucketEntry::Leaf(e) => {
                            if !listener(&e.key, self.codec.decode(&e.value)?) {
                                return Ok(());
                            }
                        }
                        _ => {
                            return Err(BonsaiError::Corruption(
                                "range scan touched internal node".to_string(),
                            ))
                        }
                    }
                    index -= 1;
                }
                bucket.left_sibling()
            };
            if !next.is_valid() {
                return Ok(());
            }
            pointer = next;
            start = i64::MAX;
        }
    }

    /// Feed entries with keys above `key` to the listener, ascending.
    pub fn load_entries_major<F>(
        &self,
        key: &BonsaiKey,
        inclusive: bool,
        mut listener: F,
    ) -> Result<()>
    where
        F: FnMut(&BonsaiKey, V) -> bool,
    {
        let state = self.read_state()?;
        self.load_entries_major_inner(&state, key, inclusive, &mut listener)
            .map_err(|e| e.in_tree(&self.name, Some(format!("{:?}", key))))
    }

    fn load_entries_major_inner(
        &self,
        state: &TreeState,
        key: &BonsaiKey,
        inclusive: bool,
        listener: &mut dyn FnMut(&BonsaiKey, V) -> bool,
    ) -> Result<()> {
        let mode = if inclusive {
            PartialSearchMode::LowestBoundary
        } else {
            PartialSearchMode::HighestBoundary
        };
        let search = self.find_bucket(state, key, mode)?;

        let mut pointer = search.bucket();
        let mut start: usize = if search.item_index >= 0 {
            if inclusive {
                search.item_index as usize
            } else {
                search.item_index as usize + 1
            }
        } else {
            (-search.item_index - 1) as usize
        };

        loop {
            let next = {
                let (_entry, mut page) = self.lock_bucket_page(state, pointer, TrackMode::None)?;
                let bucket = Bucket::attach(&mut page, pointer.page_offset, self.bucket_size());
                for index in start..bucket.size() {
                    match bucket.get_entry(index)? {
                        BucketEntry::Leaf(e) => {
                            if !listener(&e.key, self.codec.decode(&e.value)?) {
                                return Ok(());
                            }
                        }
                        _ => {
                            return Err(BonsaiError::Corruption(
                                "range scan touched internal node".to_string(),
                            ))
                        }
                    }
                }
                bucket.right_sibling()
            };
            if !next.is_valid() {
                return Ok(());
            }
            pointer = next;
            start = 0;
        }
    }

    /// Feed entries between the two boundaries to the listener, ascending.
    pub fn load_entries_between<F>(
        &self,
        from: &BonsaiKey,
        from_inclusive: bool,
        to: &BonsaiKey,
        to_inclusive: bool,
        mut listener: F,
    ) -> Result<()>
    where
        F: FnMut(&BonsaiKey, V) -> bool,
    {
        let state = self.read_state()?;
        self.load_entries_between_inner(&state, from, from_inclusive, to, to_inclusive, &mut listener)
            .map_err(|e| e.in_tree(&self.name, Some(format!("{:?}", from))))
    }

    fn load_entries_between_inner(
        &self,
        state: &TreeState,
        from: &BonsaiKey,
        from_inclusive: bool,
        to: &BonsaiKey,
        to_inclusive: bool,
        listener: &mut dyn FnMut(&BonsaiKey, V) -> bool,
    ) -> Result<()> {
        let from_mode = if from_inclusive {
            PartialSearchMode::LowestBoundary
        } else {
            PartialSearchMode::HighestBoundary
        };
        let to_bound = to.pad(
            self.key_size,
            if to_inclusive {
                PartialSearchMode::HighestBoundary
            } else {
                PartialSearchMode::LowestBoundary
            },
        );

        let search = self.find_bucket(state, from, from_mode)?;
        let mut pointer = search.bucket();
        let mut start: usize = if search.item_index >= 0 {
            if from_inclusive {
                search.item_index as usize
            } else {
                search.item_index as usize + 1
            }
        } else {
            (-search.item_index - 1) as usize
        };

        loop {
            let next = {
                let (_entry, mut page) = self.lock_bucket_page(state, pointer, TrackMode::None)?;
                let bucket = Bucket::attach(&mut page, pointer.page_offset, self.bucket_size());
                for index in start..bucket.size() {
                    match bucket.get_entry(index)? {
                        BucketEntry::Leaf(e) => {
                            let in_range = e.key < to_bound || (to_inclusive && e.key == to_bound);
                            if !in_range {
                                return Ok(());
                            }
                            if !listener(&e.key, self.codec.decode(&e.value)?) {
                                return Ok(());
                            }
                        }
                        _ => {
                            return Err(BonsaiError::Corruption(
                                "range scan touched internal node".to_string(),
                            ))
                        }
                    }
                }
                bucket.right_sibling()
            };
            if !next.is_valid() {
                return Ok(());
            }
            pointer = next;
            start = 0;
        }
    }

    /// Collect values below `key`, descending. A negative
    /// `max_values_to_fetch` collects everything.
    pub fn get_values_minor(
        &self,
        key: &BonsaiKey,
        inclusive: bool,
        max_values_to_fetch: i64,
    ) -> Result<Vec<V>> {
        let mut values = Vec::new();
        self.load_entries_minor(key, inclusive, |_, value| {
            values.push(value);
            max_values_to_fetch < 0 || (values.len() as i64) < max_values_to_fetch
        })?;
        Ok(values)
    }

    /// Collect values above `key`, ascending.
    pub fn get_values_major(
        &self,
        key: &BonsaiKey,
        inclusive: bool,
        max_values_to_fetch: i64,
    ) -> Result<Vec<V>> {
        let mut values = Vec::new();
        self.load_entries_major(key, inclusive, |_, value| {
            values.push(value);
            max_values_to_fetch < 0 || (values.len() as i64) < max_values_to_fetch
        })?;
        Ok(values)
    }

    /// Collect values between the boundaries, ascending.
    pub fn get_values_between(
        &self,
        from: &BonsaiKey,
        from_inclusive: bool,
        to: &BonsaiKey,
        to_inclusive: bool,
        max_values_to_fetch: i64,
    ) -> Result<Vec<V>> {
        let mut values = Vec::new();
        self.load_entries_between(from, from_inclusive, to, to_inclusive, |_, value| {
            values.push(value);
            max_values_to_fetch < 0 || (values.len() as i64) < max_values_to_fetch
        })?;
        Ok(values)
    }

    // ---- lifecycle ----

    /// Truncate the container file and re-create the empty root at its
    /// original pointer.
    pub fn clear(&self) -> Result<()> {
        let state = self.write_state()?;
        self.durable
            .start_durable_operation()
            .map_err(|e| e.in_tree(&self.name, None))?;

        match self.clear_inner(&state) {
            Ok(()) => self
                .durable
                .end_durable_operation(false)
                .map_err(|e| e.in_tree(&self.name, None)),
            Err(e) => {
                let _ = self.durable.end_durable_operation(true);
                Err(e.in_tree(&self.name, None))
            }
        }
    }

    fn clear_inner(&self, state: &TreeState) -> Result<()> {
        self.storage.cache().truncate_file(state.file_id)?;

        let entry = self.storage.cache().allocate_new_page(state.file_id)?;
        // The root pointer survives clear, so the first allocation after
        // truncation must land back on the root page index
        if entry.page_index() != state.root.page_index as u64 {
            return Err(BonsaiError::Corruption(format!(
                "root page reallocated at {} instead of {}",
                entry.page_index(),
                state.root.page_index
            )));
        }

        let mut page = entry.lock(self.durable.track_mode());
        let mut bucket = Bucket::init(
            &mut page,
            state.root.page_offset,
            self.bucket_size(),
            true,
        );
        bucket.set_key_serializer_id(COMPOSITE_KEY_CODEC_ID);
        bucket.set_value_serializer_id(self.codec.id());
        self.durable.log_page_changes(&mut page, true)?;
        entry.mark_dirty();
        Ok(())
    }

    /// Flush dirty pages; the tree stays usable
    pub fn flush(&self) -> Result<()> {
        let _state = self.read_state()?;
        self.storage.flush()
    }

    pub fn close(&self, flush: bool) -> Result<()> {
        let mut state = self.write_state()?;
        if flush {
            self.storage.flush()?;
        }
        self.storage.cache().close_file(state.file_id)?;
        state.open = false;
        Ok(())
    }

    /// Remove the container file from disk
    pub fn delete(&self) -> Result<()> {
        let mut state = self.write_state()?;
        self.storage.cache().delete_file(state.file_id)?;
        state.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StorageConfig;
    use crate::codec::BincodeCodec;
    use tempfile::TempDir;

    fn setup_tree() -> (TempDir, BonsaiTree<String, BincodeCodec<String>>) {
        let temp_dir = TempDir::new().unwrap();
        let storage = BonsaiStorage::open(temp_dir.path(), StorageConfig::default()).unwrap();
        let tree = BonsaiTree::create("links", 0, 1, BincodeCodec::new(), storage).unwrap();
        (temp_dir, tree)
    }

    #[test]
    fn test_put_get_single_leaf() {
        let (_temp, tree) = setup_tree();

        tree.put(BonsaiKey::int(10), &"ten".to_string()).unwrap();
        tree.put(BonsaiKey::int(5), &"five".to_string()).unwrap();

        assert_eq!(tree.get(&BonsaiKey::int(10)).unwrap().as_deref(), Some("ten"));
        assert_eq!(tree.get(&BonsaiKey::int(5)).unwrap().as_deref(), Some("five"));
        assert_eq!(tree.get(&BonsaiKey::int(99)).unwrap(), None);
        assert_eq!(tree.size().unwrap(), 2);
    }

    #[test]
    fn test_overwrite_keeps_size() {
        let (_temp, tree) = setup_tree();

        tree.put(BonsaiKey::int(1), &"a".to_string()).unwrap();
        tree.put(BonsaiKey::int(1), &"b".to_string()).unwrap();

        assert_eq!(tree.get(&BonsaiKey::int(1)).unwrap().as_deref(), Some("b"));
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn test_root_pointer_stable_across_splits() {
        let (_temp, tree) = setup_tree();
        let root_before = tree.root_bucket_pointer();

        for i in 0..2000i64 {
            tree.put(BonsaiKey::int(i), &format!("v{}", i)).unwrap();
        }

        assert_eq!(tree.root_bucket_pointer(), root_before);
        for i in 0..2000i64 {
            assert_eq!(
                tree.get(&BonsaiKey::int(i)).unwrap(),
                Some(format!("v{}", i)),
                "missing key {}",
                i
            );
        }
    }

    #[test]
    fn test_remove_returns_old_value() {
        let (_temp, tree) = setup_tree();

        tree.put(BonsaiKey::int(7), &"seven".to_string()).unwrap();

        assert_eq!(
            tree.remove(&BonsaiKey::int(7)).unwrap().as_deref(),
            Some("seven")
        );
        assert_eq!(tree.remove(&BonsaiKey::int(7)).unwrap(), None);
        assert_eq!(tree.size().unwrap(), 0);
    }

    #[test]
    fn test_wrong_arity_key_rejected() {
        let (_temp, tree) = setup_tree();

        let composite = BonsaiKey::new(vec![
            crate::key::KeyPart::Int(1),
            crate::key::KeyPart::Int(2),
        ]);
        assert!(tree.put(composite, &"x".to_string()).is_err());
    }

    #[test]
    fn test_closed_tree_rejects_operations() {
        let (_temp, tree) = setup_tree();
        tree.close(true).unwrap();
        assert!(matches!(
            tree.get(&BonsaiKey::int(1)),
            Err(BonsaiError::TreeClosed(_))
        ));
    }
}
