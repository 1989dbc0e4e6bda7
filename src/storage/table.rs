//! Composite table: frozen segments plus one live segment under one id space
//!
//! Each segment owns the contiguous logical range `[base, base + id_span)`.
//! A frozen segment keeps the local ids its writable predecessor assigned,
//! and the next live segment starts right after them, so logical ids never
//! collide and never move.
//!
//! The chain is an immutable value behind an `Arc`; freeze builds the new
//! chain off to the side and swaps the pointer, so a reader holding a chain
//! sees either the old writable segment or its frozen replacement, never both.

use super::codec::{read_frame_file, write_frame_file, CompressionAlgorithm};
use super::context::DbContext;
use super::index::IndexIter;
use super::schema::{KeyType, TableSchema};
use super::segment::{segment_dir, ReadonlySegment, StorageBackend, WritableSegment};
use super::size_cache::RecordStoreStats;
use super::store::{RowId, StoreIter};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const MANIFEST_FILE: &str = "MANIFEST";

/// A frozen segment and where it sits in the logical id space
#[derive(Clone)]
struct FrozenEntry {
    seq: u64,
    base: RowId,
    segment: Arc<ReadonlySegment>,
}

/// Immutable snapshot of a table's segments
pub struct SegmentChain {
    version: u64,
    frozen: Vec<FrozenEntry>,
    live_seq: u64,
    live_base: RowId,
    live: Arc<WritableSegment>,
}

impl SegmentChain {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_frozen(&self) -> usize {
        self.frozen.len()
    }

    /// First logical id of the live segment
    pub fn live_base(&self) -> RowId {
        self.live_base
    }

    fn locate(&self, id: RowId) -> Location<'_> {
        if id >= self.live_base {
            return Location::Live(id - self.live_base);
        }
        let pos = self.frozen.partition_point(|e| e.base <= id);
        match pos.checked_sub(1).map(|i| &self.frozen[i]) {
            Some(entry) if id - entry.base < entry.segment.id_span() => {
                Location::Frozen(entry, id - entry.base)
            }
            _ => Location::Nowhere,
        }
    }

    fn num_rows(&self) -> u64 {
        self.frozen
            .iter()
            .map(|e| e.segment.num_data_rows())
            .sum::<u64>()
            + self.live.num_data_rows()
    }

    fn data_size(&self) -> u64 {
        self.frozen
            .iter()
            .map(|e| e.segment.data_storage_size())
            .sum::<u64>()
            + self.live.data_storage_size()
    }

    fn total_storage_size(&self) -> u64 {
        self.frozen
            .iter()
            .map(|e| e.segment.total_storage_size())
            .sum::<u64>()
            + self.live.total_storage_size()
    }

    fn manifest(&self, name: &str, schema: &TableSchema) -> TableManifest {
        TableManifest {
            name: name.to_string(),
            schema: schema.clone(),
            frozen: self
                .frozen
                .iter()
                .map(|e| SegmentRecord {
                    seq: e.seq,
                    base: e.base,
                })
                .collect(),
            live: SegmentRecord {
                seq: self.live_seq,
                base: self.live_base,
            },
        }
    }
}

impl fmt::Debug for SegmentChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentChain")
            .field("version", &self.version)
            .field(
                "frozen",
                &self
                    .frozen
                    .iter()
                    .map(|e| (e.base, e.segment.id_span()))
                    .collect::<Vec<_>>(),
            )
            .field("live_base", &self.live_base)
            .field("live_rows", &self.live.num_data_rows())
            .finish()
    }
}

enum Location<'a> {
    Frozen(&'a FrozenEntry, RowId),
    Live(RowId),
    Nowhere,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentRecord {
    seq: u64,
    base: RowId,
}

/// Persistent description of a table directory
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableManifest {
    name: String,
    schema: TableSchema,
    frozen: Vec<SegmentRecord>,
    live: SegmentRecord,
}

/// Summary of a table directory, readable without opening segments
#[derive(Debug, Clone, Serialize)]
pub struct ManifestSummary {
    pub name: String,
    pub schema: TableSchema,
    pub frozen_bases: Vec<RowId>,
    pub live_base: RowId,
}

/// Read a table directory's manifest
pub fn read_manifest(dir: &Path) -> Result<ManifestSummary> {
    let manifest: TableManifest = read_frame_file(&dir.join(MANIFEST_FILE))?;
    Ok(ManifestSummary {
        name: manifest.name,
        schema: manifest.schema,
        frozen_bases: manifest.frozen.iter().map(|r| r.base).collect(),
        live_base: manifest.live.base,
    })
}

/// Logical table over a chain of segments
pub struct CompositeTable {
    name: String,
    dir: Option<PathBuf>,
    schema: Arc<TableSchema>,
    backend: Arc<dyn StorageBackend>,
    freeze_threshold_rows: u64,
    chain: RwLock<Arc<SegmentChain>>,
    // Serializes mutations, freeze and flush against each other
    write_lock: Mutex<()>,
}

impl CompositeTable {
    /// Create an empty table; with `dir` set it is persisted there
    pub fn create(
        name: impl Into<String>,
        dir: Option<&Path>,
        schema: TableSchema,
        backend: Arc<dyn StorageBackend>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let name = name.into();
        let schema = Arc::new(schema);
        let live = WritableSegment::new(backend.as_ref(), schema.clone())?;
        let chain = SegmentChain {
            version: 1,
            frozen: Vec::new(),
            live_seq: 0,
            live_base: 0,
            live: Arc::new(live),
        };

        let table = Self {
            name,
            dir: dir.map(Path::to_path_buf),
            schema,
            backend,
            freeze_threshold_rows: config.freeze_threshold_rows,
            chain: RwLock::new(Arc::new(chain)),
            write_lock: Mutex::new(()),
        };

        if let Some(dir) = &table.dir {
            if dir.join(MANIFEST_FILE).exists() {
                return Err(Error::InvalidState(format!(
                    "Table already exists at {:?}",
                    dir
                )));
            }
            std::fs::create_dir_all(dir)?;
            table.write_manifest(&table.current_chain())?;
        }

        info!(table = %table.name, indexes = table.schema.indexes.len(), "Created table");
        Ok(table)
    }

    /// Open a table directory written by `create`/`flush`/`freeze`
    #[instrument(skip_all, fields(dir = ?dir))]
    pub fn open(dir: &Path, backend: Arc<dyn StorageBackend>, config: &EngineConfig) -> Result<Self> {
        let manifest: TableManifest = read_frame_file(&dir.join(MANIFEST_FILE))?;
        let schema = Arc::new(manifest.schema);

        let frozen = manifest
            .frozen
            .iter()
            .map(|rec| {
                let segment = ReadonlySegment::open(
                    backend.as_ref(),
                    schema.clone(),
                    &segment_dir(dir, rec.seq, true),
                )?;
                Ok(FrozenEntry {
                    seq: rec.seq,
                    base: rec.base,
                    segment: Arc::new(segment),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for pair in frozen.windows(2) {
            if pair[0].base + pair[0].segment.id_span() > pair[1].base {
                return Err(Error::Corrupt(format!(
                    "Segments at {} and {} overlap",
                    pair[0].base, pair[1].base
                )));
            }
        }

        let live_dir = segment_dir(dir, manifest.live.seq, false);
        let live = if live_dir.exists() {
            WritableSegment::open(backend.as_ref(), schema.clone(), &live_dir)?
        } else {
            WritableSegment::new(backend.as_ref(), schema.clone())?
        };

        let chain = SegmentChain {
            version: 1,
            frozen,
            live_seq: manifest.live.seq,
            live_base: manifest.live.base,
            live: Arc::new(live),
        };
        info!(
            table = %manifest.name,
            frozen = chain.frozen.len(),
            rows = chain.num_rows(),
            "Opened table"
        );

        Ok(Self {
            name: manifest.name,
            dir: Some(dir.to_path_buf()),
            schema,
            backend,
            freeze_threshold_rows: config.freeze_threshold_rows,
            chain: RwLock::new(Arc::new(chain)),
            write_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Fresh context bound to the current segment chain
    pub fn create_db_context(&self) -> DbContext {
        DbContext::bound(self.current_chain())
    }

    /// The chain new operations run against
    pub fn current_chain(&self) -> Arc<SegmentChain> {
        self.chain.read().clone()
    }

    fn chain(&self, ctx: &mut DbContext) -> Arc<SegmentChain> {
        ctx.chain_for(&self.current_chain())
    }

    fn key_type(&self, index_id: usize) -> Result<KeyType> {
        Ok(self.schema.index(index_id)?.key_type)
    }

    /// Unique keys of `row` must not be held by any frozen segment
    fn check_frozen_unique(&self, chain: &SegmentChain, row: &[u8], ctx: &mut DbContext) -> Result<()> {
        for (index_id, spec) in self.schema.indexes.iter().enumerate() {
            if !spec.unique {
                continue;
            }
            let key = spec.extract_key(row)?;
            for entry in &chain.frozen {
                if let Some(local) = entry.segment.search_exact(index_id, key, ctx)? {
                    return Err(Error::DuplicateKey(format!(
                        "Index '{}' already maps {:?} to row {}",
                        spec.name,
                        key,
                        entry.base + local
                    )));
                }
            }
        }
        Ok(())
    }

    /// Append a row to the live segment, returning its logical id
    pub fn append(&self, row: &[u8], ctx: &mut DbContext) -> Result<RowId> {
        let _guard = self.write_lock.lock();
        let chain = self.chain(ctx);
        self.check_frozen_unique(&chain, row, ctx)?;
        let local = chain.live.append(row, ctx)?;
        Ok(chain.live_base + local)
    }

    /// Overwrite a row of the live segment
    pub fn replace(&self, id: RowId, row: &[u8], ctx: &mut DbContext) -> Result<()> {
        let _guard = self.write_lock.lock();
        let chain = self.chain(ctx);
        match chain.locate(id) {
            Location::Live(local) => {
                self.check_frozen_unique(&chain, row, ctx)?;
                chain.live.replace(local, row, ctx)
            }
            Location::Frozen(..) => Err(Error::InvalidState(format!(
                "Row {} lives in a frozen segment",
                id
            ))),
            Location::Nowhere => Err(Error::InvalidState(format!("Row {} is not live", id))),
        }
    }

    /// Remove a row of the live segment
    pub fn remove(&self, id: RowId, ctx: &mut DbContext) -> Result<()> {
        let _guard = self.write_lock.lock();
        let chain = self.chain(ctx);
        match chain.locate(id) {
            Location::Live(local) => chain.live.remove(local, ctx),
            Location::Frozen(..) => Err(Error::InvalidState(format!(
                "Row {} lives in a frozen segment",
                id
            ))),
            Location::Nowhere => Err(Error::InvalidState(format!("Row {} is not live", id))),
        }
    }

    /// Append the bytes of row `id` to `out`
    pub fn get_value_append(&self, id: RowId, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        let chain = self.chain(ctx);
        match chain.locate(id) {
            Location::Frozen(entry, local) => entry.segment.get_value_append(local, out, ctx),
            Location::Live(local) => chain.live.get_value_append(local, out, ctx),
            Location::Nowhere => Err(Error::NotFound(format!("Row {}", id))),
        }
    }

    pub fn get_value(&self, id: RowId, ctx: &mut DbContext) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.get_value_append(id, &mut out, ctx)?;
        Ok(out)
    }

    /// All rows in ascending logical id order
    pub fn iter_forward(&self, ctx: &mut DbContext) -> StoreIter {
        let chain = self.chain(ctx);
        let mut parts: Vec<StoreIter> = Vec::with_capacity(chain.frozen.len() + 1);
        for entry in &chain.frozen {
            parts.push(offset_rows(entry.segment.store().iter_forward(ctx), entry.base));
        }
        parts.push(offset_rows(chain.live.iter_forward(ctx), chain.live_base));
        Box::new(parts.into_iter().flatten())
    }

    /// All rows in descending logical id order
    pub fn iter_backward(&self, ctx: &mut DbContext) -> StoreIter {
        let chain = self.chain(ctx);
        let mut parts: Vec<StoreIter> = Vec::with_capacity(chain.frozen.len() + 1);
        parts.push(offset_rows(chain.live.iter_backward(ctx), chain.live_base));
        for entry in chain.frozen.iter().rev() {
            parts.push(offset_rows(entry.segment.store().iter_backward(ctx), entry.base));
        }
        Box::new(parts.into_iter().flatten())
    }

    /// Smallest logical id holding `key` in index `index_id`
    pub fn search_exact(&self, index_id: usize, key: &[u8], ctx: &mut DbContext) -> Result<Option<RowId>> {
        let chain = self.chain(ctx);
        ctx.record_seek();
        for entry in &chain.frozen {
            if let Some(local) = entry.segment.search_exact(index_id, key, ctx)? {
                return Ok(Some(entry.base + local));
            }
        }
        Ok(chain
            .live
            .search_exact(index_id, key, ctx)?
            .map(|local| chain.live_base + local))
    }

    /// Every logical id holding `key`, ascending
    pub fn search_all(&self, index_id: usize, key: &[u8], ctx: &mut DbContext) -> Result<Vec<RowId>> {
        let chain = self.chain(ctx);
        ctx.record_seek();
        let mut ids = Vec::new();
        for entry in &chain.frozen {
            let hits = entry.segment.seek_lower_bound(index_id, key, ctx)?;
            ids.extend(
                hits.take_while(|(k, _)| k.as_slice() == key)
                    .map(|(_, local)| entry.base + local),
            );
        }
        let hits = chain.live.seek_lower_bound(index_id, key, ctx)?;
        ids.extend(
            hits.take_while(|(k, _)| k.as_slice() == key)
                .map(|(_, local)| chain.live_base + local),
        );
        Ok(ids)
    }

    fn merged(&self, index_id: usize, ctx: &mut DbContext, backward: bool, from: Option<&[u8]>) -> Result<IndexIter> {
        let key_type = self.key_type(index_id)?;
        let chain = self.chain(ctx);

        let mut sources = Vec::with_capacity(chain.frozen.len() + 1);
        for entry in &chain.frozen {
            let index = entry.segment.index(index_id)?;
            let iter = match (from, backward) {
                (Some(key), _) => index.seek_lower_bound(key, ctx)?,
                (None, false) => index.iter_forward(ctx),
                (None, true) => index.iter_backward(ctx),
            };
            sources.push(offset_entries(iter, entry.base));
        }
        let iter = match (from, backward) {
            (Some(key), _) => chain.live.seek_lower_bound(index_id, key, ctx)?,
            (None, false) => chain.live.index(index_id)?.iter_forward(ctx),
            (None, true) => chain.live.index(index_id)?.iter_backward(ctx),
        };
        sources.push(offset_entries(iter, chain.live_base));

        Ok(Box::new(MergeIter::new(sources, key_type, backward)))
    }

    /// Index entries of all segments in ascending (key, logical id) order
    pub fn index_iter_forward(&self, index_id: usize, ctx: &mut DbContext) -> Result<IndexIter> {
        self.merged(index_id, ctx, false, None)
    }

    /// Index entries of all segments in descending (key, logical id) order
    pub fn index_iter_backward(&self, index_id: usize, ctx: &mut DbContext) -> Result<IndexIter> {
        self.merged(index_id, ctx, true, None)
    }

    /// Ascending merged entries starting at the first key not less than `key`
    pub fn index_lower_bound(&self, index_id: usize, key: &[u8], ctx: &mut DbContext) -> Result<IndexIter> {
        ctx.record_seek();
        self.merged(index_id, ctx, false, Some(key))
    }

    /// Convert the live segment into a frozen one and start a fresh live segment
    ///
    /// Readers keep the chain they already hold; new operations see the new
    /// chain. A failure leaves the table on its previous chain.
    #[instrument(skip(self), fields(table = %self.name))]
    pub fn freeze(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let old = self.current_chain();
        if old.live.id_span() == 0 {
            debug!("Live segment is empty, nothing to freeze");
            return Ok(());
        }

        let frozen = old.live.freeze(self.backend.as_ref())?;
        if let Some(dir) = &self.dir {
            let seg_dir = segment_dir(dir, old.live_seq, true);
            if let Err(e) = frozen.save(&seg_dir, self.backend.compression()) {
                old.live.abort_freeze();
                std::fs::remove_dir_all(&seg_dir).ok();
                return Err(e);
            }
        }
        let fresh = match WritableSegment::new(self.backend.as_ref(), self.schema.clone()) {
            Ok(fresh) => fresh,
            Err(e) => {
                old.live.abort_freeze();
                return Err(e);
            }
        };

        let mut frozen_entries = old.frozen.clone();
        let id_span = frozen.id_span();
        frozen_entries.push(FrozenEntry {
            seq: old.live_seq,
            base: old.live_base,
            segment: Arc::new(frozen),
        });
        let next = Arc::new(SegmentChain {
            version: old.version + 1,
            frozen: frozen_entries,
            live_seq: old.live_seq + 1,
            live_base: old.live_base + id_span,
            live: Arc::new(fresh),
        });
        *self.chain.write() = next.clone();

        info!(
            version = next.version,
            frozen = next.frozen.len(),
            live_base = next.live_base,
            "Swapped segment chain"
        );

        if let Some(dir) = &self.dir {
            self.write_manifest(&next)?;
            let stale = segment_dir(dir, old.live_seq, false);
            if stale.exists() {
                if let Err(e) = std::fs::remove_dir_all(&stale) {
                    warn!(dir = ?stale, error = %e, "Failed to remove replaced live segment");
                }
            }
        }
        Ok(())
    }

    /// Freeze once the live segment holds `freeze_threshold_rows` rows
    pub fn maybe_freeze(&self) -> Result<bool> {
        let live_rows = self.current_chain().live.num_data_rows();
        if live_rows < self.freeze_threshold_rows {
            return Ok(false);
        }
        debug!(table = %self.name, live_rows, "Freeze threshold reached");
        self.freeze()?;
        Ok(true)
    }

    /// Persist the live segment's rows and the manifest
    pub fn flush(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let _guard = self.write_lock.lock();
        let chain = self.current_chain();
        chain
            .live
            .save_record_store(&segment_dir(dir, chain.live_seq, false))?;
        self.write_manifest(&chain)?;
        debug!(table = %self.name, rows = chain.num_rows(), "Flushed table");
        Ok(())
    }

    fn write_manifest(&self, chain: &SegmentChain) -> Result<()> {
        match &self.dir {
            Some(dir) => write_frame_file(
                &dir.join(MANIFEST_FILE),
                &chain.manifest(&self.name, &self.schema),
                CompressionAlgorithm::None,
            ),
            None => Ok(()),
        }
    }

    pub fn num_rows(&self) -> u64 {
        self.current_chain().num_rows()
    }

    /// Live row bytes plus per-row overhead across all segments
    pub fn data_size(&self) -> u64 {
        self.current_chain().data_size()
    }

    /// Data size plus every index's size across all segments
    pub fn total_storage_size(&self) -> u64 {
        self.current_chain().total_storage_size()
    }

    pub fn num_segments(&self) -> usize {
        self.current_chain().frozen.len() + 1
    }
}

impl RecordStoreStats for CompositeTable {
    fn ident(&self) -> String {
        self.name.clone()
    }

    fn num_records(&self) -> i64 {
        self.num_rows() as i64
    }

    fn data_size(&self) -> i64 {
        CompositeTable::data_size(self) as i64
    }
}

fn offset_rows(iter: StoreIter, base: RowId) -> StoreIter {
    if base == 0 {
        return iter;
    }
    Box::new(iter.map(move |(id, row)| (id + base, row)))
}

fn offset_entries(iter: IndexIter, base: RowId) -> IndexIter {
    if base == 0 {
        return iter;
    }
    Box::new(iter.map(move |(key, id)| (key, id + base)))
}

/// k-way merge of per-segment index iterators
struct MergeIter {
    sources: Vec<IndexIter>,
    heads: Vec<Option<(Vec<u8>, RowId)>>,
    key_type: KeyType,
    backward: bool,
}

impl MergeIter {
    fn new(mut sources: Vec<IndexIter>, key_type: KeyType, backward: bool) -> Self {
        let heads = sources.iter_mut().map(|s| s.next()).collect();
        Self {
            sources,
            heads,
            key_type,
            backward,
        }
    }

    fn precedes(&self, a: &(Vec<u8>, RowId), b: &(Vec<u8>, RowId)) -> bool {
        let ord = self.key_type.compare(&a.0, &b.0).then(a.1.cmp(&b.1));
        if self.backward {
            ord == Ordering::Greater
        } else {
            ord == Ordering::Less
        }
    }
}

impl Iterator for MergeIter {
    type Item = (Vec<u8>, RowId);

    fn next(&mut self) -> Option<Self::Item> {
        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(candidate) = head else {
                continue;
            };
            best = match best.and_then(|b| self.heads[b].as_ref()) {
                Some(current) if !self.precedes(candidate, current) => best,
                _ => Some(i),
            };
        }
        let i = best?;
        let item = self.heads[i].take();
        self.heads[i] = self.sources[i].next();
        item
    }
}
