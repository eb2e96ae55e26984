// bonsailite-core/src/lib.rs
// Durable sub-page B+ tree storage core

pub mod atomic;
pub mod bucket;
pub mod cache;
pub mod codec;
pub mod document;
pub mod durable;
pub mod error;
pub mod key;
pub mod page;
pub mod record;
pub mod storage;
pub mod tree;
pub mod wal;

// Public exports
pub use bucket::{Bucket, BucketEntry, BucketPointer, InternalEntry, LeafEntry};
pub use cache::{CacheEntry, DiskCache, FileId, StorageConfig};
pub use codec::{BincodeCodec, ValueCodec};
pub use document::{Document, FieldValue};
pub use error::{BonsaiError, Result};
pub use key::{BonsaiKey, Boundary, KeyPart, OrderedFloat, PartialSearchMode};
pub use record::RecordSerializer;
pub use storage::BonsaiStorage;
pub use tree::{BonsaiTree, SearchResult};
pub use wal::{Lsn, OperationUnitId, WalRecord, WriteAheadLog};
