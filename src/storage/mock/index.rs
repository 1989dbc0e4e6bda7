//! In-memory ordered indexes, generic over the key representation

use crate::error::{Error, Result};
use crate::storage::codec::{read_frame_file, write_frame_file, CompressionAlgorithm};
use crate::storage::context::DbContext;
use crate::storage::index::{IndexIter, IndexKey, ReadableIndex, WritableIndex};
use crate::storage::store::{ReadableStore, RowId, StoreIter, ROW_OVERHEAD};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Bytes accounted per entry besides the key
const ENTRY_OVERHEAD: u64 = 8;

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "K: IndexKey")]
struct SortedEntries<K: IndexKey> {
    unique: bool,
    /// Sorted by (key, id)
    keys: Vec<K>,
    ids: Vec<RowId>,
    /// Entry positions sorted by row id
    #[serde(skip)]
    by_id: Vec<usize>,
    #[serde(skip)]
    keys_len: u64,
}

impl<K: IndexKey> SortedEntries<K> {
    fn len(&self) -> usize {
        self.keys.len()
    }

    fn lower_bound(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k < key)
    }

    fn finish(&mut self, parallel: bool) {
        self.keys_len = self.keys.iter().map(|k| k.encoded_len() as u64).sum();
        let mut by_id: Vec<usize> = (0..self.ids.len()).collect();
        if parallel {
            by_id.par_sort_unstable_by_key(|&pos| self.ids[pos]);
        } else {
            by_id.sort_unstable_by_key(|&pos| self.ids[pos]);
        }
        self.by_id = by_id;
    }

    fn validate(&self) -> Result<()> {
        if self.keys.len() != self.ids.len() {
            return Err(Error::Corrupt(format!(
                "Index has {} keys but {} ids",
                self.keys.len(),
                self.ids.len()
            )));
        }
        for i in 1..self.keys.len() {
            let prev = (&self.keys[i - 1], self.ids[i - 1]);
            let cur = (&self.keys[i], self.ids[i]);
            if prev >= cur || (self.unique && prev.0 == cur.0) {
                return Err(Error::Corrupt(format!("Index entries out of order at {}", i)));
            }
        }
        Ok(())
    }
}

/// Immutable index built in one bulk sort
pub struct MockReadonlyIndex<K: IndexKey> {
    entries: Arc<SortedEntries<K>>,
    compression: CompressionAlgorithm,
}

impl<K: IndexKey> MockReadonlyIndex<K> {
    /// Sort a batch of (key, id) pairs once
    ///
    /// Batches larger than `parallel_threshold` sort on the rayon pool.
    /// A unique index rejects the batch if two entries share a key.
    pub fn build(
        unique: bool,
        batch: Vec<(Vec<u8>, RowId)>,
        parallel_threshold: usize,
        compression: CompressionAlgorithm,
    ) -> Result<Self> {
        let parallel = batch.len() > parallel_threshold;
        let mut pairs = batch
            .into_iter()
            .map(|(key, id)| K::decode(&key).map(|k| (k, id)))
            .collect::<Result<Vec<_>>>()?;

        if parallel {
            pairs.par_sort_unstable();
        } else {
            pairs.sort_unstable();
        }
        pairs.dedup();

        if unique {
            if let Some(w) = pairs.windows(2).find(|w| w[0].0 == w[1].0) {
                return Err(Error::DuplicateKey(format!(
                    "{:?} held by rows {} and {}",
                    w[0].0, w[0].1, w[1].1
                )));
            }
        }

        let (keys, ids) = pairs.into_iter().unzip();
        let mut entries = SortedEntries {
            unique,
            keys,
            ids,
            by_id: Vec::new(),
            keys_len: 0,
        };
        entries.finish(parallel);

        debug!(entries = entries.len(), unique, parallel, "Built readonly index");
        Ok(Self {
            entries: Arc::new(entries),
            compression,
        })
    }

    /// Open an index written by `save`
    pub fn open(path: &Path, compression: CompressionAlgorithm) -> Result<Self> {
        let mut entries: SortedEntries<K> = read_frame_file(path)?;
        entries.validate()?;
        entries.finish(false);
        Ok(Self {
            entries: Arc::new(entries),
            compression,
        })
    }

    fn iter_from(&self, start: usize, backward: bool) -> IndexIter {
        Box::new(SortedEntryIter {
            entries: self.entries.clone(),
            front: start,
            back: self.entries.len(),
            backward,
        })
    }
}

impl<K: IndexKey> ReadableIndex for MockReadonlyIndex<K> {
    fn is_unique(&self) -> bool {
        self.entries.unique
    }

    fn search_exact(&self, key: &[u8], ctx: &mut DbContext) -> Result<Option<RowId>> {
        let key = K::decode(key)?;
        ctx.record_seek();
        let pos = self.entries.lower_bound(&key);
        Ok((pos < self.entries.len() && self.entries.keys[pos] == key)
            .then(|| self.entries.ids[pos]))
    }

    fn iter_forward(&self, _ctx: &mut DbContext) -> IndexIter {
        self.iter_from(0, false)
    }

    fn iter_backward(&self, _ctx: &mut DbContext) -> IndexIter {
        self.iter_from(0, true)
    }

    fn seek_lower_bound(&self, key: &[u8], ctx: &mut DbContext) -> Result<IndexIter> {
        let key = K::decode(key)?;
        ctx.record_seek();
        Ok(self.iter_from(self.entries.lower_bound(&key), false))
    }

    fn num_index_rows(&self) -> u64 {
        self.entries.len() as u64
    }

    fn index_storage_size(&self) -> u64 {
        self.entries.keys_len + ENTRY_OVERHEAD * self.entries.len() as u64
    }

    fn save(&self, path: &Path) -> Result<()> {
        write_frame_file(path, &*self.entries, self.compression)
    }
}

/// A readonly index doubles as a store of keys addressed by row id
impl<K: IndexKey> ReadableStore for MockReadonlyIndex<K> {
    fn num_data_rows(&self) -> u64 {
        self.entries.len() as u64
    }

    fn data_storage_size(&self) -> u64 {
        self.entries.keys_len + ROW_OVERHEAD * self.entries.len() as u64
    }

    fn get_value_append(&self, id: RowId, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        let by_id = &self.entries.by_id;
        let slot = by_id
            .binary_search_by_key(&id, |&pos| self.entries.ids[pos])
            .map_err(|_| Error::NotFound(format!("row {}", id)))?;
        self.entries.keys[by_id[slot]].encode_into(out);
        ctx.record_read();
        Ok(())
    }

    fn iter_forward(&self, _ctx: &mut DbContext) -> StoreIter {
        Box::new(KeyByIdIter {
            entries: self.entries.clone(),
            front: 0,
            back: self.entries.len(),
            backward: false,
        })
    }

    fn iter_backward(&self, _ctx: &mut DbContext) -> StoreIter {
        Box::new(KeyByIdIter {
            entries: self.entries.clone(),
            front: 0,
            back: self.entries.len(),
            backward: true,
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        ReadableIndex::save(self, path)
    }
}

struct SortedEntryIter<K: IndexKey> {
    entries: Arc<SortedEntries<K>>,
    front: usize,
    back: usize,
    backward: bool,
}

impl<K: IndexKey> Iterator for SortedEntryIter<K> {
    type Item = (Vec<u8>, RowId);

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
        Some((self.entries.keys[pos].encode(), self.entries.ids[pos]))
    }
}

struct KeyByIdIter<K: IndexKey> {
    entries: Arc<SortedEntries<K>>,
    front: usize,
    back: usize,
    backward: bool,
}

impl<K: IndexKey> Iterator for KeyByIdIter<K> {
    type Item = (RowId, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let slot = if self.backward {
            self.back -= 1;
            self.back
        } else {
            self.front += 1;
            self.front - 1
        };
        let pos = self.entries.by_id[slot];
        Some((self.entries.ids[pos], self.entries.keys[pos].encode()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "K: IndexKey")]
struct EntrySnapshot<K: IndexKey> {
    unique: bool,
    entries: Vec<(K, RowId)>,
}

struct EntrySet<K: IndexKey> {
    set: BTreeSet<(K, RowId)>,
    keys_len: u64,
}

impl<K: IndexKey> EntrySet<K> {
    fn first_with_key(&self, key: &K) -> Option<&(K, RowId)> {
        self.set
            .range((
                Bound::Included((key.clone(), RowId::MIN)),
                Bound::Included((key.clone(), RowId::MAX)),
            ))
            .next()
    }
}

/// Mutable index over a `BTreeSet` of (key, id)
pub struct MockWritableIndex<K: IndexKey> {
    inner: Arc<RwLock<EntrySet<K>>>,
    unique: bool,
    compression: CompressionAlgorithm,
}

impl<K: IndexKey> MockWritableIndex<K> {
    pub fn new(unique: bool, compression: CompressionAlgorithm) -> Self {
        Self {
            inner: Arc::new(RwLock::new(EntrySet {
                set: BTreeSet::new(),
                keys_len: 0,
            })),
            unique,
            compression,
        }
    }

    fn cursor(&self, lower: Bound<(K, RowId)>, backward: bool) -> IndexIter {
        Box::new(EntrySetIter {
            inner: self.inner.clone(),
            lower,
            upper: Bound::Unbounded,
            backward,
        })
    }
}

impl<K: IndexKey> ReadableIndex for MockWritableIndex<K> {
    fn is_unique(&self) -> bool {
        self.unique
    }

    fn search_exact(&self, key: &[u8], ctx: &mut DbContext) -> Result<Option<RowId>> {
        let key = K::decode(key)?;
        ctx.record_seek();
        Ok(self.inner.read().first_with_key(&key).map(|&(_, id)| id))
    }

    fn iter_forward(&self, _ctx: &mut DbContext) -> IndexIter {
        self.cursor(Bound::Unbounded, false)
    }

    fn iter_backward(&self, _ctx: &mut DbContext) -> IndexIter {
        self.cursor(Bound::Unbounded, true)
    }

    fn seek_lower_bound(&self, key: &[u8], ctx: &mut DbContext) -> Result<IndexIter> {
        let key = K::decode(key)?;
        ctx.record_seek();
        Ok(self.cursor(Bound::Included((key, RowId::MIN)), false))
    }

    fn num_index_rows(&self) -> u64 {
        self.inner.read().set.len() as u64
    }

    fn index_storage_size(&self) -> u64 {
        let inner = self.inner.read();
        inner.keys_len + ENTRY_OVERHEAD * inner.set.len() as u64
    }

    fn save(&self, path: &Path) -> Result<()> {
        let snapshot = EntrySnapshot {
            unique: self.unique,
            entries: self.inner.read().set.iter().cloned().collect(),
        };
        write_frame_file(path, &snapshot, self.compression)
    }
}

impl<K: IndexKey> WritableIndex for MockWritableIndex<K> {
    fn insert(&self, key: &[u8], id: RowId, _ctx: &mut DbContext) -> Result<bool> {
        let key = K::decode(key)?;
        let mut inner = self.inner.write();
        if self.unique {
            if let Some((_, holder)) = inner.first_with_key(&key) {
                if *holder == id {
                    return Ok(false);
                }
                return Err(Error::DuplicateKey(format!(
                    "{:?} already held by row {}",
                    key, holder
                )));
            }
        }
        let len = key.encoded_len() as u64;
        let inserted = inner.set.insert((key, id));
        if inserted {
            inner.keys_len += len;
        }
        Ok(inserted)
    }

    fn remove(&self, key: &[u8], id: RowId, _ctx: &mut DbContext) -> Result<bool> {
        let key = K::decode(key)?;
        let len = key.encoded_len() as u64;
        let mut inner = self.inner.write();
        let removed = inner.set.remove(&(key, id));
        if removed {
            inner.keys_len -= len;
        }
        Ok(removed)
    }

    fn replace(
        &self,
        key: &[u8],
        old_id: RowId,
        new_id: RowId,
        _ctx: &mut DbContext,
    ) -> Result<bool> {
        let key = K::decode(key)?;
        let len = key.encoded_len() as u64;
        let mut inner = self.inner.write();
        if !inner.set.remove(&(key.clone(), old_id)) {
            return Ok(false);
        }
        if !inner.set.insert((key, new_id)) {
            // (key, new_id) was already present: one entry fewer
            inner.keys_len -= len;
        }
        Ok(true)
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        inner.set.clear();
        inner.keys_len = 0;
    }

    fn load(&self, path: &Path) -> Result<()> {
        let snapshot: EntrySnapshot<K> = read_frame_file(path)?;
        if snapshot.unique != self.unique {
            return Err(Error::InvalidState(format!(
                "Index file unique={} does not match index unique={}",
                snapshot.unique, self.unique
            )));
        }

        let mut set = BTreeSet::new();
        let mut keys_len = 0;
        let mut last_key: Option<K> = None;
        for (key, id) in snapshot.entries {
            if self.unique && last_key.as_ref() == Some(&key) {
                return Err(Error::Corrupt(format!("Duplicate key {:?} in unique index", key)));
            }
            keys_len += key.encoded_len() as u64;
            last_key = Some(key.clone());
            set.insert((key, id));
        }

        *self.inner.write() = EntrySet { set, keys_len };
        Ok(())
    }
}

/// Cursor over a writable index; reseeks under the read lock each step
struct EntrySetIter<K: IndexKey> {
    inner: Arc<RwLock<EntrySet<K>>>,
    lower: Bound<(K, RowId)>,
    upper: Bound<(K, RowId)>,
    backward: bool,
}

impl<K: IndexKey> Iterator for EntrySetIter<K> {
    type Item = (Vec<u8>, RowId);

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.read();
        let mut range = inner.set.range((self.lower.clone(), self.upper.clone()));
        let entry = if self.backward {
            range.next_back()
        } else {
            range.next()
        }?
        .clone();
        drop(inner);

        let item = (entry.0.encode(), entry.1);
        if self.backward {
            self.upper = Bound::Excluded(entry);
        } else {
            self.lower = Bound::Excluded(entry);
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_of(iter: IndexIter) -> Vec<Vec<u8>> {
        iter.map(|(k, _)| k).collect()
    }

    #[test]
    fn test_writable_unique_rejects_duplicate_without_change() -> Result<()> {
        let index = MockWritableIndex::<Vec<u8>>::new(true, CompressionAlgorithm::None);
        let mut ctx = DbContext::new();

        assert!(index.insert(b"b", 1, &mut ctx)?);
        assert!(index.insert(b"a", 2, &mut ctx)?);
        let before: Vec<_> = index.iter_forward(&mut ctx).collect();
        let size_before = index.index_storage_size();

        let err = index.insert(b"a", 3, &mut ctx).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
        assert_eq!(index.num_index_rows(), 2);
        assert_eq!(index.index_storage_size(), size_before);
        assert_eq!(index.iter_forward(&mut ctx).collect::<Vec<_>>(), before);

        // re-inserting the same pair is a no-op, not a violation
        assert!(!index.insert(b"a", 2, &mut ctx)?);
        Ok(())
    }

    #[test]
    fn test_writable_non_unique_order() -> Result<()> {
        let index = MockWritableIndex::<Vec<u8>>::new(false, CompressionAlgorithm::None);
        let mut ctx = DbContext::new();
        for (key, id) in [(&b"m"[..], 4), (b"a", 9), (b"m", 1), (b"z", 0), (b"a", 2)] {
            index.insert(key, id, &mut ctx)?;
        }

        let forward: Vec<_> = index.iter_forward(&mut ctx).collect();
        assert_eq!(
            forward,
            vec![
                (b"a".to_vec(), 2),
                (b"a".to_vec(), 9),
                (b"m".to_vec(), 1),
                (b"m".to_vec(), 4),
                (b"z".to_vec(), 0),
            ]
        );
        let mut backward: Vec<_> = index.iter_backward(&mut ctx).collect();
        backward.reverse();
        assert_eq!(forward, backward);

        // first match is the smallest id
        assert_eq!(index.search_exact(b"m", &mut ctx)?, Some(1));
        assert_eq!(index.search_exact(b"q", &mut ctx)?, None);
        Ok(())
    }

    #[test]
    fn test_writable_numeric_keys_order_numerically() -> Result<()> {
        let index = MockWritableIndex::<i64>::new(false, CompressionAlgorithm::None);
        let mut ctx = DbContext::new();
        for (n, id) in [(300i64, 0), (-5, 1), (2, 2)] {
            index.insert(&n.to_le_bytes(), id, &mut ctx)?;
        }
        let ids: Vec<_> = index.iter_forward(&mut ctx).map(|(_, id)| id).collect();
        assert_eq!(ids, vec![1, 2, 0]);

        assert!(index.insert(b"short", 3, &mut ctx).is_err());
        Ok(())
    }

    #[test]
    fn test_writable_remove_and_replace() -> Result<()> {
        let index = MockWritableIndex::<Vec<u8>>::new(true, CompressionAlgorithm::None);
        let mut ctx = DbContext::new();
        index.insert(b"k1", 1, &mut ctx)?;
        index.insert(b"k2", 2, &mut ctx)?;

        assert!(index.remove(b"k1", 1, &mut ctx)?);
        assert!(!index.remove(b"k1", 1, &mut ctx)?);
        assert!(!index.remove(b"k2", 7, &mut ctx)?);

        assert!(index.replace(b"k2", 2, 20, &mut ctx)?);
        assert_eq!(index.search_exact(b"k2", &mut ctx)?, Some(20));
        assert!(!index.replace(b"k2", 2, 21, &mut ctx)?);
        assert_eq!(index.num_index_rows(), 1);
        assert_eq!(index.index_storage_size(), 2 + ENTRY_OVERHEAD);

        index.clear();
        assert_eq!(index.num_index_rows(), 0);
        assert_eq!(index.index_storage_size(), 0);
        Ok(())
    }

    #[test]
    fn test_writable_seek_lower_bound() -> Result<()> {
        let index = MockWritableIndex::<u64>::new(false, CompressionAlgorithm::None);
        let mut ctx = DbContext::new();
        for n in [10u64, 20, 30, 40] {
            index.insert(&n.to_le_bytes(), n, &mut ctx)?;
        }
        let ids: Vec<_> = index
            .seek_lower_bound(&25u64.to_le_bytes(), &mut ctx)?
            .map(|(_, id)| id)
            .collect();
        assert_eq!(ids, vec![30, 40]);
        Ok(())
    }

    #[test]
    fn test_writable_iterator_restartable() -> Result<()> {
        let index = MockWritableIndex::<Vec<u8>>::new(false, CompressionAlgorithm::None);
        let mut ctx = DbContext::new();
        index.insert(b"a", 0, &mut ctx)?;
        index.insert(b"b", 1, &mut ctx)?;

        let mut first = index.iter_forward(&mut ctx);
        first.next();
        let second = keys_of(index.iter_forward(&mut ctx));
        assert_eq!(second, vec![b"a".to_vec(), b"b".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_writable_save_load() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("segdb_mock_index_{}", std::process::id()));
        let path = dir.join("idx.seg");
        let mut ctx = DbContext::new();

        let index = MockWritableIndex::<Vec<u8>>::new(true, CompressionAlgorithm::Zstd);
        index.insert(b"x", 1, &mut ctx)?;
        index.insert(b"yy", 2, &mut ctx)?;
        index.save(&path)?;

        let restored = MockWritableIndex::<Vec<u8>>::new(true, CompressionAlgorithm::Zstd);
        restored.load(&path)?;
        assert_eq!(
            restored.iter_forward(&mut ctx).collect::<Vec<_>>(),
            index.iter_forward(&mut ctx).collect::<Vec<_>>()
        );
        assert_eq!(restored.index_storage_size(), index.index_storage_size());

        let mismatched = MockWritableIndex::<Vec<u8>>::new(false, CompressionAlgorithm::Zstd);
        assert!(matches!(
            mismatched.load(&path).unwrap_err(),
            Error::InvalidState(_)
        ));

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_readonly_build_matches_writable() -> Result<()> {
        let mut ctx = DbContext::new();
        let pairs: Vec<(Vec<u8>, RowId)> = (0..500u64)
            .map(|i| (((i * 7919) % 101).to_le_bytes().to_vec(), i))
            .collect();

        let writable = MockWritableIndex::<u64>::new(false, CompressionAlgorithm::None);
        for (key, id) in &pairs {
            writable.insert(key, *id, &mut ctx)?;
        }
        // threshold below batch size exercises the parallel sort
        let readonly =
            MockReadonlyIndex::<u64>::build(false, pairs, 100, CompressionAlgorithm::None)?;

        assert_eq!(
            ReadableIndex::iter_forward(&readonly, &mut ctx).collect::<Vec<_>>(),
            writable.iter_forward(&mut ctx).collect::<Vec<_>>()
        );
        assert_eq!(
            ReadableIndex::iter_backward(&readonly, &mut ctx).collect::<Vec<_>>(),
            writable.iter_backward(&mut ctx).collect::<Vec<_>>()
        );
        assert_eq!(readonly.index_storage_size(), writable.index_storage_size());
        for key in [0u64, 50, 100, 101] {
            let key = key.to_le_bytes();
            assert_eq!(
                readonly.search_exact(&key, &mut ctx)?,
                writable.search_exact(&key, &mut ctx)?
            );
        }
        Ok(())
    }

    #[test]
    fn test_readonly_unique_rejects_duplicates() {
        let batch = vec![(b"k".to_vec(), 1), (b"j".to_vec(), 2), (b"k".to_vec(), 3)];
        let err = MockReadonlyIndex::<Vec<u8>>::build(true, batch, 1000, CompressionAlgorithm::None)
            .err()
            .expect("duplicate keys must fail");
        assert!(matches!(err, Error::DuplicateKey(_)));
    }

    #[test]
    fn test_readonly_seek_and_key_store() -> Result<()> {
        let mut ctx = DbContext::new();
        let batch = vec![
            (b"delta".to_vec(), 3),
            (b"alpha".to_vec(), 8),
            (b"charlie".to_vec(), 1),
        ];
        let index =
            MockReadonlyIndex::<Vec<u8>>::build(true, batch, 1000, CompressionAlgorithm::None)?;

        let from_b = keys_of(index.seek_lower_bound(b"b", &mut ctx)?);
        assert_eq!(from_b, vec![b"charlie".to_vec(), b"delta".to_vec()]);
        assert!(index.seek_lower_bound(b"zzz", &mut ctx)?.next().is_none());

        // store view: id -> key, ascending ids
        assert_eq!(index.get_value(8, &mut ctx)?, b"alpha");
        let ids: Vec<_> = ReadableStore::iter_forward(&index, &mut ctx)
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![1, 3, 8]);
        assert!(index.get_value(2, &mut ctx).is_err());
        Ok(())
    }

    #[test]
    fn test_readonly_save_open() -> Result<()> {
        let dir =
            std::env::temp_dir().join(format!("segdb_mock_ro_index_{}", std::process::id()));
        let path = dir.join("idx.seg");
        let mut ctx = DbContext::new();

        let batch = (0..20i64).map(|i| ((-i).to_le_bytes().to_vec(), i as u64)).collect();
        let index = MockReadonlyIndex::<i64>::build(true, batch, 1000, CompressionAlgorithm::Zstd)?;
        ReadableIndex::save(&index, &path)?;

        let opened = MockReadonlyIndex::<i64>::open(&path, CompressionAlgorithm::Zstd)?;
        assert!(opened.is_unique());
        assert_eq!(opened.num_index_rows(), 20);
        assert_eq!(
            ReadableIndex::iter_forward(&opened, &mut ctx).collect::<Vec<_>>(),
            ReadableIndex::iter_forward(&index, &mut ctx).collect::<Vec<_>>()
        );
        assert_eq!(opened.get_value(4, &mut ctx)?, (-4i64).to_le_bytes().to_vec());

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }
}
