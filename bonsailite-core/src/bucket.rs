// src/bucket.rs
// One B+ tree node laid out inside a sub-region of a page.
//
// Region layout:
//   header (44 bytes): leaf flag, serializer ids, entry count, free-space
//   pointer, sibling pointers, tree size
//   slot directory: entry count x u32 payload offsets, sorted by key
//   payloads: variable-length entries growing down from the region end
//
// Removed or superseded payloads are left in place as garbage; the region
// is never compacted except by `shrink`.

use std::fmt;

use crate::error::{BonsaiError, Result};
use crate::key::BonsaiKey;
use crate::page::PageGuard;

const IS_LEAF_OFFSET: usize = 0;
const KEY_SERIALIZER_OFFSET: usize = 1;
const VALUE_SERIALIZER_OFFSET: usize = 2;
const SIZE_OFFSET: usize = 4;
const FREE_POINTER_OFFSET: usize = 8;
const LEFT_SIBLING_OFFSET: usize = 12;
const RIGHT_SIBLING_OFFSET: usize = 24;
const TREE_SIZE_OFFSET: usize = 36;
const POSITIONS_ARRAY_OFFSET: usize = 44;

const POINTER_SIZE: usize = 12;

/// Address of a bucket: which page, and where inside it the region begins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketPointer {
    pub page_index: i64,
    pub page_offset: u32,
}

impl BucketPointer {
    pub const NULL: BucketPointer = BucketPointer {
        page_index: -1,
        page_offset: 0,
    };

    pub fn new(page_index: i64, page_offset: u32) -> Self {
        BucketPointer {
            page_index,
            page_offset,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.page_index >= 0
    }
}

impl fmt::Display for BucketPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_index, self.page_offset)
    }
}

/// Leaf payload: key and encoded value
#[derive(Debug, Clone, PartialEq)]
pub struct LeafEntry {
    pub key: BonsaiKey,
    pub value: Vec<u8>,
}

/// Internal payload: separator key between two children
#[derive(Debug, Clone, PartialEq)]
pub struct InternalEntry {
    pub left: BucketPointer,
    pub right: BucketPointer,
    pub key: BonsaiKey,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BucketEntry {
    Leaf(LeafEntry),
    Internal(InternalEntry),
}

impl BucketEntry {
    pub fn key(&self) -> &BonsaiKey {
        match self {
            BucketEntry::Leaf(e) => &e.key,
            BucketEntry::Internal(e) => &e.key,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            BucketEntry::Leaf(e) => {
                let key_bytes = e.key.to_bytes()?;
                buf.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
                buf.extend_from_slice(&key_bytes);
                buf.extend_from_slice(&(e.value.len() as u32).to_le_bytes());
                buf.extend_from_slice(&e.value);
            }
            BucketEntry::Internal(e) => {
                buf.extend_from_slice(&e.left.page_index.to_le_bytes());
                buf.extend_from_slice(&e.left.page_offset.to_le_bytes());
                buf.extend_from_slice(&e.right.page_index.to_le_bytes());
                buf.extend_from_slice(&e.right.page_offset.to_le_bytes());
                let key_bytes = e.key.to_bytes()?;
                buf.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
                buf.extend_from_slice(&key_bytes);
            }
        }
        Ok(buf)
    }
}

/// View over one node region of a locked page
pub struct Bucket<'a> {
    page: &'a mut PageGuard,
    offset: usize,
    bucket_size: usize,
}

impl<'a> Bucket<'a> {
    /// Attach to an already formatted region
    pub fn attach(page: &'a mut PageGuard, offset: u32, bucket_size: usize) -> Self {
        Bucket {
            page,
            offset: offset as usize,
            bucket_size,
        }
    }

    /// Format the region as an empty node
    pub fn init(page: &'a mut PageGuard, offset: u32, bucket_size: usize, is_leaf: bool) -> Self {
        let mut bucket = Bucket {
            page,
            offset: offset as usize,
            bucket_size,
        };
        bucket.reset(is_leaf);
        bucket.set_left_sibling(BucketPointer::NULL);
        bucket.set_right_sibling(BucketPointer::NULL);
        bucket.set_tree_size(0);
        bucket
    }

    /// Largest entry payload a single empty bucket can host
    pub fn max_entry_payload(bucket_size: usize) -> usize {
        bucket_size - POSITIONS_ARRAY_OFFSET - 4
    }

    fn abs(&self, rel: usize) -> usize {
        self.offset + rel
    }

    fn reset(&mut self, is_leaf: bool) {
        self.page.set_u8(self.abs(IS_LEAF_OFFSET), is_leaf as u8);
        self.page.set_u32(self.abs(SIZE_OFFSET), 0);
        self.page
            .set_u32(self.abs(FREE_POINTER_OFFSET), self.bucket_size as u32);
    }

    pub fn is_leaf(&self) -> bool {
        self.page.get_u8(self.abs(IS_LEAF_OFFSET)) != 0
    }

    pub fn size(&self) -> usize {
        self.page.get_u32(self.abs(SIZE_OFFSET)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn free_pointer(&self) -> usize {
        self.page.get_u32(self.abs(FREE_POINTER_OFFSET)) as usize
    }

    fn slot(&self, index: usize) -> usize {
        self.page
            .get_u32(self.abs(POSITIONS_ARRAY_OFFSET + index * 4)) as usize
    }

    fn set_slot(&mut self, index: usize, data_offset: usize) {
        self.page.set_u32(
            self.abs(POSITIONS_ARRAY_OFFSET + index * 4),
            data_offset as u32,
        );
    }

    /// Binary search. Non-negative: entry index of an exact match. Negative:
    /// `-(insertion index) - 1`.
    pub fn find(&self, key: &BonsaiKey) -> Result<i32> {
        let mut low: i32 = 0;
        let mut high: i32 = self.size() as i32 - 1;

        while low <= high {
            let mid = (low + high) >> 1;
            let mid_key = self.get_key(mid as usize)?;
            match mid_key.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid - 1,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Ok(-(low + 1))
    }

    fn key_area(&self, index: usize) -> usize {
        let data = self.slot(index);
        if self.is_leaf() {
            data
        } else {
            data + 2 * POINTER_SIZE
        }
    }

    pub fn get_key(&self, index: usize) -> Result<BonsaiKey> {
        let key_area = self.key_area(index);
        let key_len = self.page.get_u16(self.abs(key_area)) as usize;
        BonsaiKey::from_bytes(self.page.bytes(self.abs(key_area + 2), key_len))
    }

    pub fn get_entry(&self, index: usize) -> Result<BucketEntry> {
        let data = self.slot(index);
        if self.is_leaf() {
            let key_len = self.page.get_u16(self.abs(data)) as usize;
            let key = BonsaiKey::from_bytes(self.page.bytes(self.abs(data + 2), key_len))?;
            let value_area = data + 2 + key_len;
            let value_len = self.page.get_u32(self.abs(value_area)) as usize;
            let value = self
                .page
                .bytes(self.abs(value_area + 4), value_len)
                .to_vec();
            Ok(BucketEntry::Leaf(LeafEntry { key, value }))
        } else {
            let left = self.read_pointer(data);
            let right = self.read_pointer(data + POINTER_SIZE);
            let key_len = self.page.get_u16(self.abs(data + 2 * POINTER_SIZE)) as usize;
            let key = BonsaiKey::from_bytes(
                self.page
                    .bytes(self.abs(data + 2 * POINTER_SIZE + 2), key_len),
            )?;
            Ok(BucketEntry::Internal(InternalEntry { left, right, key }))
        }
    }

    fn read_pointer(&self, rel: usize) -> BucketPointer {
        BucketPointer::new(
            self.page.get_i64(self.abs(rel)),
            self.page.get_u32(self.abs(rel + 8)),
        )
    }

    fn write_pointer(&mut self, rel: usize, pointer: BucketPointer) {
        self.page.set_i64(self.abs(rel), pointer.page_index);
        self.page.set_u32(self.abs(rel + 8), pointer.page_offset);
    }

    fn set_left_child(&mut self, index: usize, pointer: BucketPointer) {
        let data = self.slot(index);
        self.write_pointer(data, pointer);
    }

    fn set_right_child(&mut self, index: usize, pointer: BucketPointer) {
        let data = self.slot(index);
        self.write_pointer(data + POINTER_SIZE, pointer);
    }

    /// Insert an entry at `index`. Returns false when the region has no room
    /// for it; the caller must split. With `update_size = false` the entry is
    /// appended past the current count without touching neighbors, which is
    /// how `add_all` reconstructs a node from a full list.
    pub fn add_entry(
        &mut self,
        index: usize,
        entry: &BucketEntry,
        update_size: bool,
    ) -> Result<bool> {
        let payload = entry.encode()?;
        let stored = self.size();
        let slots_after = (stored + 1).max(index + 1);

        let head_end = POSITIONS_ARRAY_OFFSET + slots_after * 4;
        let free = self.free_pointer();
        if payload.len() > free || free - payload.len() < head_end {
            return Ok(false);
        }
        let data_offset = free - payload.len();

        if update_size && index < stored {
            // Shift the slot directory right to open the gap
            let src = POSITIONS_ARRAY_OFFSET + index * 4;
            self.page
                .move_bytes(self.abs(src), self.abs(src + 4), (stored - index) * 4);
        }

        self.page.set_bytes(self.abs(data_offset), &payload);
        self.set_slot(index, data_offset);
        self.page
            .set_u32(self.abs(FREE_POINTER_OFFSET), data_offset as u32);

        if update_size {
            self.page.set_u32(self.abs(SIZE_OFFSET), (stored + 1) as u32);

            // Adjacent internal entries share children with the new one
            if let BucketEntry::Internal(e) = entry {
                if index > 0 {
                    self.set_right_child(index - 1, e.left);
                }
                if index + 1 < stored + 1 {
                    self.set_left_child(index + 1, e.right);
                }
            }
        }
        Ok(true)
    }

    /// Bulk-append after a split. The entries must already be sorted.
    pub fn add_all(&mut self, entries: &[BucketEntry]) -> Result<()> {
        let base = self.size();
        for (k, entry) in entries.iter().enumerate() {
            if !self.add_entry(base + k, entry, false)? {
                return Err(BonsaiError::Corruption(
                    "bulk append exceeded bucket capacity".to_string(),
                ));
            }
        }
        self.page
            .set_u32(self.abs(SIZE_OFFSET), (base + entries.len()) as u32);
        Ok(())
    }

    /// Replace the value of leaf entry `index` in place. Returns false when
    /// the grown value no longer fits; the caller must split and retry.
    pub fn update_value(&mut self, index: usize, value: &[u8]) -> Result<bool> {
        let data = self.slot(index);
        let key_len = self.page.get_u16(self.abs(data)) as usize;
        let value_area = data + 2 + key_len;
        let old_len = self.page.get_u32(self.abs(value_area)) as usize;

        if old_len == value.len() {
            self.page.set_bytes(self.abs(value_area + 4), value);
            return Ok(true);
        }

        // Size changed: rewrite the whole payload at the free pointer and
        // abandon the old one
        let key = self.get_key(index)?;
        let payload = BucketEntry::Leaf(LeafEntry {
            key,
            value: value.to_vec(),
        })
        .encode()?;

        let head_end = POSITIONS_ARRAY_OFFSET + self.size() * 4;
        let free = self.free_pointer();
        if payload.len() > free || free - payload.len() < head_end {
            return Ok(false);
        }
        let data_offset = free - payload.len();

        self.page.set_bytes(self.abs(data_offset), &payload);
        self.set_slot(index, data_offset);
        self.page
            .set_u32(self.abs(FREE_POINTER_OFFSET), data_offset as u32);
        Ok(true)
    }

    /// Delete entry `index`. Siblings are never merged.
    pub fn remove(&mut self, index: usize) {
        let stored = self.size();
        if index + 1 < stored {
            let src = POSITIONS_ARRAY_OFFSET + (index + 1) * 4;
            self.page.move_bytes(
                self.abs(src),
                self.abs(src - 4),
                (stored - index - 1) * 4,
            );
        }
        self.page.set_u32(self.abs(SIZE_OFFSET), (stored - 1) as u32);
    }

    /// Truncate to the first `n` entries, reclaiming the payload space of
    /// everything else. Used after a split copies the right half elsewhere.
    pub fn shrink(&mut self, n: usize) -> Result<()> {
        let mut kept = Vec::with_capacity(n);
        for i in 0..n {
            kept.push(self.get_entry(i)?);
        }
        self.page.set_u32(self.abs(SIZE_OFFSET), 0);
        self.page
            .set_u32(self.abs(FREE_POINTER_OFFSET), self.bucket_size as u32);
        self.add_all(&kept)
    }

    pub fn left_sibling(&self) -> BucketPointer {
        self.read_pointer(LEFT_SIBLING_OFFSET)
    }

    pub fn set_left_sibling(&mut self, pointer: BucketPointer) {
        self.write_pointer(LEFT_SIBLING_OFFSET, pointer);
    }

    pub fn right_sibling(&self) -> BucketPointer {
        self.read_pointer(RIGHT_SIBLING_OFFSET)
    }

    pub fn set_right_sibling(&mut self, pointer: BucketPointer) {
        self.write_pointer(RIGHT_SIBLING_OFFSET, pointer);
    }

    pub fn tree_size(&self) -> u64 {
        self.page.get_u64(self.abs(TREE_SIZE_OFFSET))
    }

    pub fn set_tree_size(&mut self, size: u64) {
        self.page.set_u64(self.abs(TREE_SIZE_OFFSET), size);
    }

    pub fn key_serializer_id(&self) -> u8 {
        self.page.get_u8(self.abs(KEY_SERIALIZER_OFFSET))
    }

    pub fn set_key_serializer_id(&mut self, id: u8) {
        self.page.set_u8(self.abs(KEY_SERIALIZER_OFFSET), id);
    }

    pub fn value_serializer_id(&self) -> u8 {
        self.page.get_u8(self.abs(VALUE_SERIALIZER_OFFSET))
    }

    pub fn set_value_serializer_id(&mut self, id: u8) {
        self.page.set_u8(self.abs(VALUE_SERIALIZER_OFFSET), id);
    }

    /// Rewrite the region as an internal node, keeping root metadata (tree
    /// size, serializer ids) intact. Used by the root split.
    pub fn convert_to_internal(&mut self) {
        self.page.set_u8(self.abs(IS_LEAF_OFFSET), 0);
        self.page.set_u32(self.abs(SIZE_OFFSET), 0);
        self.page
            .set_u32(self.abs(FREE_POINTER_OFFSET), self.bucket_size as u32);
        self.set_left_sibling(BucketPointer::NULL);
        self.set_right_sibling(BucketPointer::NULL);
    }
}
