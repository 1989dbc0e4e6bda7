//! Row store contracts
//!
//! A row store is an id-addressable container of opaque byte rows.
//! Readonly stores are built once and never change; writable stores accept
//! appends, in-place replacement and logical removal.
//!
//! Invariants every backend upholds:
//! - `num_data_rows()` is the number of ids `get_value_append` succeeds for
//! - iteration visits exactly those ids, ascending (forward) or descending
//! - a removed id is never returned again and never handed out by `append`

use super::context::DbContext;
use crate::error::Result;
use std::path::Path;

/// Row identifier, unique within a segment
pub type RowId = u64;

/// Fixed per-row overhead counted by `data_storage_size` (length prefix)
pub const ROW_OVERHEAD: u64 = 4;

/// Lazy (id, bytes) sequence
///
/// Iterators own what they need, so they stay valid while other readers
/// and writers use the store. Each step yields a whole row or nothing.
pub type StoreIter = Box<dyn Iterator<Item = (RowId, Vec<u8>)> + Send>;

/// Read access to a row store
pub trait ReadableStore: Send + Sync {
    /// Number of live rows
    fn num_data_rows(&self) -> u64;

    /// Sum of live row lengths plus `ROW_OVERHEAD` per row
    fn data_storage_size(&self) -> u64;

    /// Append the bytes of row `id` to `out`; `NotFound` if `id` is not live
    fn get_value_append(&self, id: RowId, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()>;

    /// Rows in ascending id order
    fn iter_forward(&self, ctx: &mut DbContext) -> StoreIter;

    /// Rows in descending id order
    fn iter_backward(&self, ctx: &mut DbContext) -> StoreIter;

    /// Serialize the full store content to `path`
    fn save(&self, path: &Path) -> Result<()>;

    /// Convenience wrapper over `get_value_append`
    fn get_value(&self, id: RowId, ctx: &mut DbContext) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.get_value_append(id, &mut out, ctx)?;
        Ok(out)
    }
}

/// Mutation of a row store
///
/// Methods take `&self`; implementations serialize mutations internally.
pub trait WritableStore: ReadableStore {
    /// Store a new row and return its freshly allocated id
    fn append(&self, row: &[u8], ctx: &mut DbContext) -> Result<RowId>;

    /// Overwrite the bytes of a live row
    fn replace(&self, id: RowId, row: &[u8], ctx: &mut DbContext) -> Result<()>;

    /// Mark a live row dead
    fn remove(&self, id: RowId, ctx: &mut DbContext) -> Result<()>;

    /// Drop all rows and reset id allocation
    fn clear(&self);

    /// Replace the store content with what `save` wrote to `path`
    fn load(&self, path: &Path) -> Result<()>;

    /// Id the next `append` will return
    fn next_row_id(&self) -> RowId;
}

/// Rows collected for a bulk build, ascending by id
#[derive(Debug, Clone, Default)]
pub struct RowBatch {
    ids: Vec<RowId>,
    rows: Vec<Vec<u8>>,
    /// Ids the source segment had allocated, live or not
    id_span: RowId,
}

impl RowBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a store iterator (already in ascending order)
    pub fn collect_from(iter: StoreIter, id_span: RowId) -> Self {
        let mut batch = Self::new();
        for (id, row) in iter {
            batch.ids.push(id);
            batch.rows.push(row);
        }
        batch.id_span = id_span.max(batch.ids.last().map_or(0, |id| id + 1));
        batch
    }

    /// Add a row; ids must be pushed in ascending order
    pub fn push(&mut self, id: RowId, row: Vec<u8>) {
        debug_assert!(self.ids.last().map_or(true, |&last| last < id));
        self.ids.push(id);
        self.rows.push(row);
        self.id_span = self.id_span.max(id + 1);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id_span(&self) -> RowId {
        self.id_span
    }

    pub fn iter(&self) -> impl Iterator<Item = (RowId, &[u8])> + '_ {
        self.ids
            .iter()
            .copied()
            .zip(self.rows.iter().map(|r| r.as_slice()))
    }

    pub fn into_parts(self) -> (Vec<RowId>, Vec<Vec<u8>>, RowId) {
        (self.ids, self.rows, self.id_span)
    }
}
