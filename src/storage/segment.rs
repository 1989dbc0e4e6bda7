//! Segments: one row store plus its indexes
//!
//! A segment is either frozen (readonly, built once in bulk) or live
//! (writable, kept consistent on every mutation). Freezing drains a live
//! segment in id order into a new readonly segment; the live segment is
//! then discarded by its owner.
//!
//! ```text
//! Building ──→ Active (WritableSegment) ──freeze──→ Frozen (ReadonlySegment)
//!    └────────────────────────────────────────────→ Frozen
//! ```

use super::codec::{read_frame_file, write_frame_file, CompressionAlgorithm};
use super::context::DbContext;
use super::index::{IndexIter, ReadableIndex, WritableIndex};
use super::schema::{IndexSpec, TableSchema};
use super::store::{ReadableStore, RowBatch, RowId, StoreIter, WritableStore};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const STORE_FILE: &str = "store.seg";
const META_FILE: &str = "segment.meta";

fn index_file(spec: &IndexSpec) -> String {
    format!("index-{}.seg", spec.name)
}

/// Factory for the concrete stores and indexes of a backend
///
/// `build_*` constructs frozen structures from a finished batch in one pass;
/// `open_*` reconstructs them from files written by `save`; `create_*` makes
/// empty writable structures.
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    fn build_store(&self, batch: RowBatch) -> Result<Arc<dyn ReadableStore>>;

    fn build_index(
        &self,
        spec: &IndexSpec,
        entries: Vec<(Vec<u8>, RowId)>,
    ) -> Result<Arc<dyn ReadableIndex>>;

    fn open_store(&self, path: &Path) -> Result<Arc<dyn ReadableStore>>;

    fn open_index(&self, spec: &IndexSpec, path: &Path) -> Result<Arc<dyn ReadableIndex>>;

    fn create_store(&self) -> Result<Arc<dyn WritableStore>>;

    fn create_index(&self, spec: &IndexSpec) -> Result<Arc<dyn WritableIndex>>;

    /// Compression used for segment metadata files
    fn compression(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }
}

/// Lifecycle state of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Building,
    Active,
    Frozen,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentMeta {
    id_span: RowId,
    num_rows: u64,
}

/// Immutable segment
pub struct ReadonlySegment {
    schema: Arc<TableSchema>,
    store: Arc<dyn ReadableStore>,
    indexes: Vec<Arc<dyn ReadableIndex>>,
    id_span: RowId,
}

impl ReadonlySegment {
    /// Build store and every declared index from one batch
    pub fn build(
        backend: &dyn StorageBackend,
        schema: Arc<TableSchema>,
        batch: RowBatch,
    ) -> Result<Self> {
        schema.validate()?;
        let id_span = batch.id_span();
        debug!(rows = batch.len(), state = ?SegmentState::Building, "Building readonly segment");

        let keyed: Vec<Vec<(Vec<u8>, RowId)>> = schema
            .indexes
            .iter()
            .map(|spec| {
                batch
                    .iter()
                    .map(|(id, row)| spec.extract_key(row).map(|k| (k.to_vec(), id)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<_>>()?;

        let indexes = schema
            .indexes
            .par_iter()
            .zip(keyed.into_par_iter())
            .map(|(spec, entries)| backend.build_index(spec, entries))
            .collect::<Result<Vec<_>>>()?;
        let store = backend.build_store(batch)?;

        info!(
            rows = store.num_data_rows(),
            indexes = indexes.len(),
            id_span,
            "Built readonly segment"
        );
        Ok(Self {
            schema,
            store,
            indexes,
            id_span,
        })
    }

    /// Reopen a segment directory written by `save`
    pub fn open(backend: &dyn StorageBackend, schema: Arc<TableSchema>, dir: &Path) -> Result<Self> {
        schema.validate()?;
        let meta: SegmentMeta = read_frame_file(&dir.join(META_FILE))?;
        let store = backend.open_store(&dir.join(STORE_FILE))?;
        if store.num_data_rows() != meta.num_rows {
            return Err(Error::Corrupt(format!(
                "Segment {:?} has {} rows, metadata says {}",
                dir,
                store.num_data_rows(),
                meta.num_rows
            )));
        }

        let indexes = schema
            .indexes
            .iter()
            .map(|spec| backend.open_index(spec, &dir.join(index_file(spec))))
            .collect::<Result<Vec<_>>>()?;

        info!(dir = ?dir, rows = meta.num_rows, "Opened readonly segment");
        Ok(Self {
            schema,
            store,
            indexes,
            id_span: meta.id_span,
        })
    }

    /// Persist store, indexes and metadata into `dir`
    pub fn save(&self, dir: &Path, compression: CompressionAlgorithm) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.store.save(&dir.join(STORE_FILE))?;
        for (spec, index) in self.schema.indexes.iter().zip(&self.indexes) {
            index.save(&dir.join(index_file(spec)))?;
        }
        let meta = SegmentMeta {
            id_span: self.id_span,
            num_rows: self.store.num_data_rows(),
        };
        write_frame_file(&dir.join(META_FILE), &meta, compression)
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::Frozen
    }

    pub fn store(&self) -> &Arc<dyn ReadableStore> {
        &self.store
    }

    pub fn index(&self, index_id: usize) -> Result<&Arc<dyn ReadableIndex>> {
        self.indexes
            .get(index_id)
            .ok_or_else(|| Error::InvalidArgument(format!("No index #{}", index_id)))
    }

    /// Number of local ids this segment covers, live or not
    pub fn id_span(&self) -> RowId {
        self.id_span
    }

    pub fn num_data_rows(&self) -> u64 {
        self.store.num_data_rows()
    }

    pub fn data_storage_size(&self) -> u64 {
        self.store.data_storage_size()
    }

    pub fn total_storage_size(&self) -> u64 {
        self.store.data_storage_size()
            + self
                .indexes
                .iter()
                .map(|i| i.index_storage_size())
                .sum::<u64>()
    }

    pub fn get_value_append(&self, id: RowId, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        self.store.get_value_append(id, out, ctx)
    }

    pub fn search_exact(&self, index_id: usize, key: &[u8], ctx: &mut DbContext) -> Result<Option<RowId>> {
        self.index(index_id)?.search_exact(key, ctx)
    }

    pub fn seek_lower_bound(&self, index_id: usize, key: &[u8], ctx: &mut DbContext) -> Result<IndexIter> {
        self.index(index_id)?.seek_lower_bound(key, ctx)
    }
}

/// Mutable segment
///
/// Mutations hold the segment's op lock exclusively for their whole
/// store-plus-indexes update; point reads share it, so a reader never sees
/// a row whose index entries are missing.
pub struct WritableSegment {
    schema: Arc<TableSchema>,
    store: Arc<dyn WritableStore>,
    indexes: Vec<Arc<dyn WritableIndex>>,
    op_lock: RwLock<()>,
    sealed: AtomicBool,
}

impl WritableSegment {
    pub fn new(backend: &dyn StorageBackend, schema: Arc<TableSchema>) -> Result<Self> {
        schema.validate()?;
        let store = backend.create_store()?;
        let indexes = schema
            .indexes
            .iter()
            .map(|spec| backend.create_index(spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema,
            store,
            indexes,
            op_lock: RwLock::new(()),
            sealed: AtomicBool::new(false),
        })
    }

    /// Restore a segment from `save_record_store` output, rebuilding indexes
    pub fn open(backend: &dyn StorageBackend, schema: Arc<TableSchema>, dir: &Path) -> Result<Self> {
        let segment = Self::new(backend, schema)?;
        segment.load_record_store(dir)?;
        Ok(segment)
    }

    pub fn state(&self) -> SegmentState {
        if self.sealed.load(Ordering::Acquire) {
            SegmentState::Frozen
        } else {
            SegmentState::Active
        }
    }

    fn check_active(&self) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::InvalidState("Segment is frozen".to_string()));
        }
        Ok(())
    }

    /// Run `f` on the bytes of live row `id`
    ///
    /// The row is read into the context's scratch buffer, which is handed
    /// back afterwards so the next call reuses its allocation.
    fn with_live_row<T>(
        &self,
        id: RowId,
        ctx: &mut DbContext,
        f: impl FnOnce(&[u8], &mut DbContext) -> Result<T>,
    ) -> Result<T> {
        let mut old_row = std::mem::take(&mut ctx.row_buf);
        old_row.clear();
        let result = match self.store.get_value_append(id, &mut old_row, ctx) {
            Ok(()) => f(old_row.as_slice(), ctx),
            Err(Error::NotFound(_)) => Err(Error::InvalidState(format!("Row {} is not live", id))),
            Err(e) => Err(e),
        };
        ctx.row_buf = old_row;
        result
    }

    fn check_unique(&self, index_id: usize, key: &[u8], owner: Option<RowId>, ctx: &mut DbContext) -> Result<()> {
        let index = &self.indexes[index_id];
        if !index.is_unique() {
            return Ok(());
        }
        match index.search_exact(key, ctx)? {
            Some(holder) if Some(holder) != owner => Err(Error::DuplicateKey(format!(
                "Index '{}' already maps {:?} to row {}",
                self.schema.indexes[index_id].name, key, holder
            ))),
            _ => Ok(()),
        }
    }

    /// Append a row and index it; on any failure nothing stays applied
    pub fn append(&self, row: &[u8], ctx: &mut DbContext) -> Result<RowId> {
        let _guard = self.op_lock.write();
        self.check_active()?;

        let keys = self.schema.extract_keys(row)?;
        for (i, key) in keys.iter().enumerate() {
            self.check_unique(i, key, None, ctx)?;
        }

        let id = self.store.append(row, ctx)?;
        for (i, key) in keys.iter().enumerate() {
            if let Err(e) = self.indexes[i].insert(key, id, ctx) {
                self.drop_entries(id, &keys[..i], ctx);
                if let Err(undo) = self.store.remove(id, ctx) {
                    warn!(row = id, error = %undo, "Rollback of appended row failed");
                }
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Remove `keys[i]` from index `i` for row `id`, logging what cannot be undone
    fn drop_entries(&self, id: RowId, keys: &[&[u8]], ctx: &mut DbContext) {
        for (i, key) in keys.iter().enumerate() {
            if let Err(e) = self.indexes[i].remove(key, id, ctx) {
                warn!(row = id, index = i, error = %e, "Rollback of index entry failed");
            }
        }
    }

    /// Insert `keys[i]` into index `i` for row `id`, logging what cannot be undone
    fn restore_entries(&self, id: RowId, keys: &[&[u8]], ctx: &mut DbContext) {
        for (i, key) in keys.iter().enumerate() {
            if let Err(e) = self.indexes[i].insert(key, id, ctx) {
                warn!(row = id, index = i, error = %e, "Restoring index entry failed");
            }
        }
    }

    /// Move row `id` from key `from` to key `to` in one index
    ///
    /// On failure the index is back at `from`, unless the undo itself failed.
    fn move_entry(&self, index_id: usize, from: &[u8], to: &[u8], id: RowId, ctx: &mut DbContext) -> Result<()> {
        let index = &self.indexes[index_id];
        index.remove(from, id, ctx)?;
        if let Err(e) = index.insert(to, id, ctx) {
            if let Err(undo) = index.insert(from, id, ctx) {
                warn!(row = id, index = index_id, error = %undo, "Restoring index entry failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Overwrite a live row, moving index entries whose key changed
    ///
    /// On failure the store and every index are put back as they were.
    pub fn replace(&self, id: RowId, row: &[u8], ctx: &mut DbContext) -> Result<()> {
        let _guard = self.op_lock.write();
        self.check_active()?;

        let new_keys = self.schema.extract_keys(row)?;
        self.with_live_row(id, ctx, |old_row, ctx| {
            let old_keys = self.schema.extract_keys(old_row)?;
            for (i, (old, new)) in old_keys.iter().zip(&new_keys).enumerate() {
                if old != new {
                    self.check_unique(i, new, Some(id), ctx)?;
                }
            }

            self.store.replace(id, row, ctx)?;
            for (i, (old, new)) in old_keys.iter().zip(&new_keys).enumerate() {
                if old == new {
                    continue;
                }
                if let Err(e) = self.move_entry(i, old, new, id, ctx) {
                    for (j, (old, new)) in old_keys[..i].iter().zip(&new_keys[..i]).enumerate() {
                        if old != new {
                            if let Err(undo) = self.move_entry(j, new, old, id, ctx) {
                                warn!(row = id, index = j, error = %undo, "Rollback of moved key failed");
                            }
                        }
                    }
                    if let Err(undo) = self.store.replace(id, old_row, ctx) {
                        warn!(row = id, error = %undo, "Rollback of replaced row failed");
                    }
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    /// Remove a live row and its index entries
    ///
    /// Index entries go first and the row last; on failure everything
    /// removed so far is put back.
    pub fn remove(&self, id: RowId, ctx: &mut DbContext) -> Result<()> {
        let _guard = self.op_lock.write();
        self.check_active()?;

        self.with_live_row(id, ctx, |old_row, ctx| {
            let keys = self.schema.extract_keys(old_row)?;
            for (i, key) in keys.iter().enumerate() {
                if let Err(e) = self.indexes[i].remove(key, id, ctx) {
                    self.restore_entries(id, &keys[..i], ctx);
                    return Err(e);
                }
            }
            if let Err(e) = self.store.remove(id, ctx) {
                self.restore_entries(id, &keys, ctx);
                return Err(e);
            }
            Ok(())
        })
    }

    /// Drop every row and index entry
    pub fn clear(&self) -> Result<()> {
        let _guard = self.op_lock.write();
        self.check_active()?;
        self.store.clear();
        for index in &self.indexes {
            index.clear();
        }
        Ok(())
    }

    pub fn get_value_append(&self, id: RowId, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        let _guard = self.op_lock.read();
        self.store.get_value_append(id, out, ctx)
    }

    pub fn search_exact(&self, index_id: usize, key: &[u8], ctx: &mut DbContext) -> Result<Option<RowId>> {
        let index = self.index(index_id)?;
        let _guard = self.op_lock.read();
        index.search_exact(key, ctx)
    }

    pub fn seek_lower_bound(&self, index_id: usize, key: &[u8], ctx: &mut DbContext) -> Result<IndexIter> {
        let index = self.index(index_id)?;
        let _guard = self.op_lock.read();
        index.seek_lower_bound(key, ctx)
    }

    pub fn iter_forward(&self, ctx: &mut DbContext) -> StoreIter {
        self.store.iter_forward(ctx)
    }

    pub fn iter_backward(&self, ctx: &mut DbContext) -> StoreIter {
        self.store.iter_backward(ctx)
    }

    pub fn store(&self) -> &Arc<dyn WritableStore> {
        &self.store
    }

    pub fn index(&self, index_id: usize) -> Result<&Arc<dyn WritableIndex>> {
        self.indexes
            .get(index_id)
            .ok_or_else(|| Error::InvalidArgument(format!("No index #{}", index_id)))
    }

    pub fn num_data_rows(&self) -> u64 {
        self.store.num_data_rows()
    }

    /// Local ids allocated so far
    pub fn id_span(&self) -> RowId {
        self.store.next_row_id()
    }

    pub fn data_storage_size(&self) -> u64 {
        self.store.data_storage_size()
    }

    /// Store size plus all index sizes
    pub fn total_storage_size(&self) -> u64 {
        self.store.data_storage_size()
            + self
                .indexes
                .iter()
                .map(|i| i.index_storage_size())
                .sum::<u64>()
    }

    /// Persist raw row data; indexes are derived again on load
    pub fn save_record_store(&self, dir: &Path) -> Result<()> {
        let _guard = self.op_lock.read();
        std::fs::create_dir_all(dir)?;
        self.store.save(&dir.join(STORE_FILE))
    }

    /// Fill an empty segment from a saved record store and replay rows into indexes
    ///
    /// Fails with `InvalidState` on a segment that has ever allocated an id.
    /// If any row cannot be indexed, the segment is emptied again and the
    /// error returned, so the store and indexes never disagree.
    pub fn load_record_store(&self, dir: &Path) -> Result<()> {
        let _guard = self.op_lock.write();
        self.check_active()?;
        if self.store.next_row_id() != 0 || self.store.num_data_rows() != 0 {
            return Err(Error::InvalidState(
                "Record store can only be loaded into an empty segment".to_string(),
            ));
        }

        self.store.load(&dir.join(STORE_FILE))?;
        if let Err(e) = self.replay_indexes() {
            warn!(dir = ?dir, error = %e, "Index replay failed, segment left empty");
            self.store.clear();
            for index in &self.indexes {
                index.clear();
            }
            return Err(e);
        }

        info!(dir = ?dir, rows = self.store.num_data_rows(), "Loaded writable segment");
        Ok(())
    }

    fn replay_indexes(&self) -> Result<()> {
        let mut ctx = DbContext::new();
        for (id, row) in self.store.iter_forward(&mut ctx) {
            let keys = self.schema.extract_keys(&row)?;
            for (index, key) in self.indexes.iter().zip(keys) {
                index.insert(key, id, &mut ctx)?;
            }
        }
        Ok(())
    }

    /// Convert current content into a readonly segment
    ///
    /// The segment is sealed first, so no mutation slips in while rows are
    /// drained. If the build fails the seal is lifted and the segment stays
    /// usable.
    #[instrument(skip_all, fields(rows = self.num_data_rows()))]
    pub fn freeze(&self, backend: &dyn StorageBackend) -> Result<ReadonlySegment> {
        let batch = {
            let _guard = self.op_lock.write();
            self.check_active()?;
            self.sealed.store(true, Ordering::Release);
            let mut ctx = DbContext::new();
            RowBatch::collect_from(self.store.iter_forward(&mut ctx), self.store.next_row_id())
        };

        match ReadonlySegment::build(backend, self.schema.clone(), batch) {
            Ok(segment) => {
                info!(rows = segment.num_data_rows(), "Froze writable segment");
                Ok(segment)
            }
            Err(e) => {
                warn!(error = %e, "Freeze failed, segment stays writable");
                self.abort_freeze();
                Err(e)
            }
        }
    }

    /// Lift the seal set by `freeze` when the frozen result is not adopted
    pub(crate) fn abort_freeze(&self) {
        self.sealed.store(false, Ordering::Release);
    }
}

/// Directory naming for persisted segments
pub fn segment_dir(table_dir: &Path, seq: u64, frozen: bool) -> PathBuf {
    if frozen {
        table_dir.join(format!("ro-{:06}", seq))
    } else {
        table_dir.join(format!("wr-{:06}", seq))
    }
}
