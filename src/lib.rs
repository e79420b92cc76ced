//! Bramble - a concurrent, disk-paged B+-tree index engine
//!
//! The engine is organized into a few layers:
//!
//! - **Storage** (`storage`): page-granular disk I/O
//!   - `DiskManager`: reads, writes, and allocates fixed-size pages
//!   - `DiskScheduler`: background worker thread funneling page I/O
//!   - `Page`: a buffer frame with pin count, dirty flag, and a manually
//!     acquired reader/writer latch
//!   - `HeaderPage`: persists `(index name, root page id)` records on page 0
//!
//! - **Buffer pool** (`buffer`): memory management for pages
//!   - `BufferPoolManager`: pins pages into frames, evicting as needed
//!   - `LruReplacer`: constant-time least-recently-used victim selection
//!
//! - **Hashing** (`hash`): `ExtendibleHash`, a concurrent map with a
//!   doubling directory and bucket-granular latches; the buffer pool uses
//!   it as its page table
//!
//! - **Index** (`index`): `BPlusTree`, a concurrent B+-tree over fixed-width
//!   keys using latch-crabbing, with split / coalesce / redistribute
//!   rebalancing and a leaf-chained forward iterator
//!
//! - **Concurrency** (`concurrency`): `Transaction`, the per-operation set
//!   of latched pages and deferred page deletions
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bramble::buffer::BufferPoolManager;
//! use bramble::concurrency::Transaction;
//! use bramble::index::{BPlusTree, GenericComparator, GenericKey};
//! use bramble::common::RecordId;
//! use bramble::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("index.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, disk_manager));
//!
//! let tree: BPlusTree<GenericKey<8>, GenericComparator<8>> =
//!     BPlusTree::new("orders_pk", bpm, GenericComparator::<8>).unwrap();
//!
//! let mut txn = Transaction::new();
//! let key = GenericKey::<8>::from_i64(42);
//! tree.insert(&key, RecordId::new(7, 0), &mut txn).unwrap();
//! assert!(tree.get_value(&key, &mut txn).unwrap().is_some());
//! ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod hash;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{BrambleError, FrameId, PageId, RecordId, Result};
