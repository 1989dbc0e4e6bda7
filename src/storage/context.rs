//! Per-operation context
//!
//! A `DbContext` belongs to exactly one caller at a time. Stores and indexes
//! borrow it for the duration of a call and never keep it. It carries the
//! scratch buffer live segments read old rows into on replace and remove,
//! and, when made by a table, a snapshot of the table's segment chain.

use super::table::SegmentChain;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Operation context
#[derive(Debug)]
pub struct DbContext {
    id: u64,
    chain: Option<Arc<SegmentChain>>,
    /// Scratch buffer for row bytes; holds the last row read into it
    pub(crate) row_buf: Vec<u8>,
    rows_read: u64,
    index_seeks: u64,
}

impl DbContext {
    /// Create a context not bound to any table
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            chain: None,
            row_buf: Vec::new(),
            rows_read: 0,
            index_seeks: 0,
        }
    }

    pub(crate) fn bound(chain: Arc<SegmentChain>) -> Self {
        let mut ctx = Self::new();
        ctx.chain = Some(chain);
        ctx
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Version of the segment chain this context is bound to
    pub fn chain_version(&self) -> Option<u64> {
        self.chain.as_ref().map(|c| c.version())
    }

    /// Chain snapshot, replaced when the table has moved on to a newer chain
    pub(crate) fn chain_for(&mut self, current: &Arc<SegmentChain>) -> Arc<SegmentChain> {
        match &self.chain {
            Some(c) if c.version() == current.version() => c.clone(),
            _ => {
                self.chain = Some(current.clone());
                current.clone()
            }
        }
    }

    pub(crate) fn record_read(&mut self) {
        self.rows_read += 1;
    }

    pub(crate) fn record_seek(&mut self) {
        self.index_seeks += 1;
    }

    /// Rows fetched through this context
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Index seeks issued through this context
    pub fn index_seeks(&self) -> u64 {
        self.index_seeks
    }
}

impl Default for DbContext {
    fn default() -> Self {
        Self::new()
    }
}
