//! Ordered index contracts
//!
//! An index maps keys to row ids of the segment it belongs to. Entries are
//! ordered by key, ties broken by row id, which gives a strict total order
//! over (key, id) pairs regardless of insertion history.
//!
//! Keys cross the trait boundary as encoded bytes; each backend decodes them
//! into its own key representation (see [`IndexKey`]) and orders by that.

use super::context::DbContext;
use super::store::RowId;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::path::Path;

/// Lazy (key bytes, id) sequence
pub type IndexIter = Box<dyn Iterator<Item = (Vec<u8>, RowId)> + Send>;

/// Key representation usable by generic index backends
pub trait IndexKey:
    Ord + Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Decode an encoded key
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Append the encoded key to `out`
    fn encode_into(&self, out: &mut Vec<u8>);

    /// Length of the encoded key
    fn encoded_len(&self) -> usize;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }
}

impl IndexKey for Vec<u8> {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn encoded_len(&self) -> usize {
        self.len()
    }
}

fn fixed8(bytes: &[u8]) -> Result<[u8; 8]> {
    bytes.try_into().map_err(|_| {
        Error::InvalidArgument(format!(
            "Numeric key must be 8 bytes, got {}",
            bytes.len()
        ))
    })
}

impl IndexKey for u64 {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(u64::from_le_bytes(fixed8(bytes)?))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn encoded_len(&self) -> usize {
        8
    }
}

impl IndexKey for i64 {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(i64::from_le_bytes(fixed8(bytes)?))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn encoded_len(&self) -> usize {
        8
    }
}

/// Read access to an ordered index
pub trait ReadableIndex: Send + Sync {
    /// Whether at most one entry may carry a given key
    fn is_unique(&self) -> bool;

    /// Row id for `key`; for non-unique indexes the smallest id carrying it
    fn search_exact(&self, key: &[u8], ctx: &mut DbContext) -> Result<Option<RowId>>;

    fn exists(&self, key: &[u8], ctx: &mut DbContext) -> Result<bool> {
        Ok(self.search_exact(key, ctx)?.is_some())
    }

    /// Entries in ascending (key, id) order
    fn iter_forward(&self, ctx: &mut DbContext) -> IndexIter;

    /// Entries in descending (key, id) order
    fn iter_backward(&self, ctx: &mut DbContext) -> IndexIter;

    /// Ascending entries starting at the first key not less than `key`
    fn seek_lower_bound(&self, key: &[u8], ctx: &mut DbContext) -> Result<IndexIter>;

    fn num_index_rows(&self) -> u64;

    /// Encoded key bytes plus 8 bytes per entry
    fn index_storage_size(&self) -> u64;

    /// Serialize all entries to `path`
    fn save(&self, path: &Path) -> Result<()>;
}

/// Mutation of an ordered index
pub trait WritableIndex: ReadableIndex {
    /// Insert (key, id)
    ///
    /// `Ok(false)` when the exact pair is already present. A unique index
    /// holding `key` under another id fails with `DuplicateKey` and is left
    /// untouched.
    fn insert(&self, key: &[u8], id: RowId, ctx: &mut DbContext) -> Result<bool>;

    /// Remove (key, id), reporting whether it was present
    fn remove(&self, key: &[u8], id: RowId, ctx: &mut DbContext) -> Result<bool>;

    /// Move `key` from `old_id` to `new_id` in one step
    fn replace(&self, key: &[u8], old_id: RowId, new_id: RowId, ctx: &mut DbContext)
        -> Result<bool>;

    /// Drop all entries
    fn clear(&self);

    /// Replace all entries with what `save` wrote to `path`
    fn load(&self, path: &Path) -> Result<()>;
}
