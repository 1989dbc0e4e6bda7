//! Storage layer
//!
//! # Architecture
//!
//! A table is a chain of segments sharing one logical row-id space:
//!
//! ```text
//! CompositeTable
//!   └─→ SegmentChain (swapped atomically on freeze)
//!        ├─→ ReadonlySegment* (oldest first, immutable)
//!        │     └─→ ReadableStore + ReadableIndex per declared index
//!        └─→ WritableSegment (exactly one, receives all writes)
//!              └─→ WritableStore + WritableIndex per declared index
//! ```
//!
//! Stores and indexes are traits; [`mock`] holds the in-memory backend that
//! every segment is built from by default. [`size_cache`] remembers row counts
//! and sizes of tables across restarts.

pub mod codec;
pub mod context;
pub mod index;
pub mod mock;
pub mod schema;
pub mod segment;
pub mod size_cache;
pub mod store;
pub mod table;

pub use codec::CompressionAlgorithm;
pub use context::DbContext;
pub use index::{IndexIter, IndexKey, ReadableIndex, WritableIndex};
pub use mock::MockBackend;
pub use schema::{IndexSpec, KeyType, TableSchema};
pub use segment::{ReadonlySegment, SegmentState, StorageBackend, WritableSegment};
pub use size_cache::{RecordStoreStats, SizeCache};
pub use store::{ReadableStore, RowBatch, RowId, StoreIter, WritableStore};
pub use table::{CompositeTable, SegmentChain};
