//! In-memory row stores

use crate::error::{Error, Result};
use crate::storage::codec::{read_frame_file, write_frame_file, CompressionAlgorithm};
use crate::storage::context::DbContext;
use crate::storage::store::{
    ReadableStore, RowBatch, RowId, StoreIter, WritableStore, ROW_OVERHEAD,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Packed rows of a readonly store: row `i` is `data[offsets[i]..offsets[i + 1]]`
#[derive(Debug, Default, Serialize, Deserialize)]
struct PackedRows {
    ids: Vec<RowId>,
    offsets: Vec<usize>,
    data: Vec<u8>,
}

impl PackedRows {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn row(&self, pos: usize) -> &[u8] {
        &self.data[self.offsets[pos]..self.offsets[pos + 1]]
    }

    fn position(&self, id: RowId) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    fn validate(&self) -> Result<()> {
        if self.offsets.len() != self.ids.len() + 1 {
            return Err(Error::Corrupt(format!(
                "Store has {} ids but {} offsets",
                self.ids.len(),
                self.offsets.len()
            )));
        }
        if self.offsets.first() != Some(&0)
            || self.offsets.last() != Some(&self.data.len())
            || self.offsets.windows(2).any(|w| w[0] > w[1])
        {
            return Err(Error::Corrupt("Store row offsets out of range".to_string()));
        }
        if self.ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Corrupt("Store ids not strictly ascending".to_string()));
        }
        Ok(())
    }
}

/// Immutable store built once from a row batch
pub struct MockReadonlyStore {
    rows: Arc<PackedRows>,
    compression: CompressionAlgorithm,
}

impl MockReadonlyStore {
    /// Pack a finished batch; ids keep the values they had in the batch
    pub fn build(batch: RowBatch, compression: CompressionAlgorithm) -> Self {
        let (ids, rows, _) = batch.into_parts();
        let total: usize = rows.iter().map(|r| r.len()).sum();

        let mut packed = PackedRows {
            ids,
            offsets: Vec::with_capacity(rows.len() + 1),
            data: Vec::with_capacity(total),
        };
        packed.offsets.push(0);
        for row in rows {
            packed.data.extend_from_slice(&row);
            packed.offsets.push(packed.data.len());
        }

        debug!(rows = packed.len(), bytes = total, "Built readonly store");
        Self {
            rows: Arc::new(packed),
            compression,
        }
    }

    /// Open a store written by `save`
    pub fn open(path: &Path, compression: CompressionAlgorithm) -> Result<Self> {
        let packed: PackedRows = read_frame_file(path)?;
        packed.validate()?;
        Ok(Self {
            rows: Arc::new(packed),
            compression,
        })
    }
}

impl ReadableStore for MockReadonlyStore {
    fn num_data_rows(&self) -> u64 {
        self.rows.len() as u64
    }

    fn data_storage_size(&self) -> u64 {
        self.rows.data.len() as u64 + ROW_OVERHEAD * self.rows.len() as u64
    }

    fn get_value_append(&self, id: RowId, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        let pos = self
            .rows
            .position(id)
            .ok_or_else(|| Error::NotFound(format!("row {}", id)))?;
        out.extend_from_slice(self.rows.row(pos));
        ctx.record_read();
        Ok(())
    }

    fn iter_forward(&self, _ctx: &mut DbContext) -> StoreIter {
        Box::new(PackedRowIter {
            rows: self.rows.clone(),
            front: 0,
            back: self.rows.len(),
            backward: false,
        })
    }

    fn iter_backward(&self, _ctx: &mut DbContext) -> StoreIter {
        Box::new(PackedRowIter {
            rows: self.rows.clone(),
            front: 0,
            back: self.rows.len(),
            backward: true,
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        write_frame_file(path, &*self.rows, self.compression)
    }
}

struct PackedRowIter {
    rows: Arc<PackedRows>,
    front: usize,
    back: usize,
    backward: bool,
}

impl Iterator for PackedRowIter {
    type Item = (RowId, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let pos = if self.backward {
            self.back -= 1;
            self.back
        } else {
            self.front += 1;
            self.front - 1
        };
        Some((self.rows.ids[pos], self.rows.row(pos).to_vec()))
    }
}

/// Rows of a writable store; `None` marks a removed id
#[derive(Debug, Default, Serialize, Deserialize)]
struct SlotRows {
    rows: Vec<Option<Vec<u8>>>,
    #[serde(skip)]
    live: u64,
    #[serde(skip)]
    data_size: u64,
}

impl SlotRows {
    fn recount(&mut self) {
        self.live = 0;
        self.data_size = 0;
        for row in self.rows.iter().flatten() {
            self.live += 1;
            self.data_size += row.len() as u64 + ROW_OVERHEAD;
        }
    }

    fn live_row(&self, id: RowId) -> Option<&Vec<u8>> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.rows.get(i))
            .and_then(|slot| slot.as_ref())
    }
}

/// Growable store; ids are slot positions and are never reused
#[derive(Default)]
pub struct MockWritableStore {
    inner: Arc<RwLock<SlotRows>>,
    compression: CompressionAlgorithm,
}

impl MockWritableStore {
    pub fn new(compression: CompressionAlgorithm) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SlotRows::default())),
            compression,
        }
    }
}

impl ReadableStore for MockWritableStore {
    fn num_data_rows(&self) -> u64 {
        self.inner.read().live
    }

    fn data_storage_size(&self) -> u64 {
        self.inner.read().data_size
    }

    fn get_value_append(&self, id: RowId, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        let inner = self.inner.read();
        let row = inner
            .live_row(id)
            .ok_or_else(|| Error::NotFound(format!("row {}", id)))?;
        out.extend_from_slice(row);
        drop(inner);
        ctx.record_read();
        Ok(())
    }

    fn iter_forward(&self, _ctx: &mut DbContext) -> StoreIter {
        Box::new(SlotRowIter {
            inner: self.inner.clone(),
            cursor: 0,
            backward: false,
        })
    }

    fn iter_backward(&self, _ctx: &mut DbContext) -> StoreIter {
        let end = self.inner.read().rows.len() as RowId;
        Box::new(SlotRowIter {
            inner: self.inner.clone(),
            cursor: end,
            backward: true,
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        write_frame_file(path, &*inner, self.compression)
    }
}

impl WritableStore for MockWritableStore {
    fn append(&self, row: &[u8], _ctx: &mut DbContext) -> Result<RowId> {
        let mut inner = self.inner.write();
        let id = inner.rows.len() as RowId;
        inner.rows.push(Some(row.to_vec()));
        inner.live += 1;
        inner.data_size += row.len() as u64 + ROW_OVERHEAD;
        Ok(id)
    }

    fn replace(&self, id: RowId, row: &[u8], _ctx: &mut DbContext) -> Result<()> {
        let mut inner = self.inner.write();
        let old_len = inner
            .live_row(id)
            .map(|r| r.len() as u64)
            .ok_or_else(|| Error::NotFound(format!("row {}", id)))?;
        inner.rows[id as usize] = Some(row.to_vec());
        inner.data_size = inner.data_size - old_len + row.len() as u64;
        Ok(())
    }

    fn remove(&self, id: RowId, _ctx: &mut DbContext) -> Result<()> {
        let mut inner = self.inner.write();
        let old_len = inner
            .live_row(id)
            .map(|r| r.len() as u64)
            .ok_or_else(|| Error::NotFound(format!("row {}", id)))?;
        inner.rows[id as usize] = None;
        inner.live -= 1;
        inner.data_size -= old_len + ROW_OVERHEAD;
        Ok(())
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        inner.rows.clear();
        inner.live = 0;
        inner.data_size = 0;
    }

    fn load(&self, path: &Path) -> Result<()> {
        let mut loaded: SlotRows = read_frame_file(path)?;
        loaded.recount();
        debug!(path = ?path, rows = loaded.live, "Loaded writable store");
        *self.inner.write() = loaded;
        Ok(())
    }

    fn next_row_id(&self) -> RowId {
        self.inner.read().rows.len() as RowId
    }
}

/// Cursor over a writable store; takes the read lock one row at a time
struct SlotRowIter {
    inner: Arc<RwLock<SlotRows>>,
    cursor: RowId,
    backward: bool,
}

impl Iterator for SlotRowIter {
    type Item = (RowId, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.read();
        if self.backward {
            while self.cursor > 0 {
                self.cursor -= 1;
                if let Some(row) = inner.live_row(self.cursor) {
                    return Some((self.cursor, row.clone()));
                }
            }
            None
        } else {
            while (self.cursor as usize) < inner.rows.len() {
                let id = self.cursor;
                self.cursor += 1;
                if let Some(row) = inner.live_row(id) {
                    return Some((id, row.clone()));
                }
            }
            None
        }
    }
}
