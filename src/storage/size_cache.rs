//! Persistent per-table row count and size cache
//!
//! Answers cardinality queries for tables without scanning them. Open tables
//! are tracked through a weak reference and refreshed on every sync; closed
//! tables keep the values observed at close.
//!
//! # File format
//!
//! Little-endian, no compression:
//!
//! ```text
//! [u64 entry count]
//! repeated: [u32 key len][key bytes][i64 num records][i64 data size]
//! ```
//!
//! Keys are UTF-8 table identifiers. The cache is advisory: a missing or
//! damaged file yields an empty cache, and an entry whose key is not UTF-8
//! is dropped on load without affecting the others.

use super::codec::write_file_atomic;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed bytes per entry besides the key
const ENTRY_SIZE: usize = 16;

/// Live statistics source for a cache entry
pub trait RecordStoreStats: Send + Sync {
    /// Identifier the cache files the entry under (UTF-8)
    fn ident(&self) -> String;

    fn num_records(&self) -> i64;

    fn data_size(&self) -> i64;
}

struct Entry {
    num_records: i64,
    data_size: i64,
    dirty: bool,
    store: Option<Weak<dyn RecordStoreStats>>,
}

impl Entry {
    fn new(num_records: i64, data_size: i64) -> Self {
        Self {
            num_records,
            data_size,
            dirty: true,
            store: None,
        }
    }

    fn set(&mut self, num_records: i64, data_size: i64) {
        self.num_records = num_records;
        self.data_size = data_size;
        self.dirty = true;
    }
}

/// Table identifier → last known (num records, data size)
pub struct SizeCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
    // Orders disk syncs; never held together with a store call
    io_lock: Mutex<()>,
}

impl SizeCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(HashMap::new()),
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a table being opened and start tracking it
    pub fn on_create<S: RecordStoreStats + 'static>(&self, store: &Arc<S>, num_records: i64, data_size: i64) {
        let weak: Weak<S> = Arc::downgrade(store);
        let weak: Weak<dyn RecordStoreStats> = weak;
        let ident = store.ident();
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(ident)
            .or_insert_with(|| Entry::new(num_records, data_size));
        entry.set(num_records, data_size);
        entry.store = Some(weak);
    }

    /// Record a table being closed with its final statistics
    pub fn on_destroy(&self, store: &dyn RecordStoreStats) {
        let ident = store.ident();
        let num_records = store.num_records();
        let data_size = store.data_size();

        let mut entries = self.entries.lock();
        let entry = entries
            .entry(ident)
            .or_insert_with(|| Entry::new(num_records, data_size));
        entry.set(num_records, data_size);
        entry.store = None;
    }

    /// Set an entry directly
    ///
    /// Identifiers are UTF-8; the file stores them as length-prefixed bytes.
    pub fn store_to_cache(&self, ident: &str, num_records: i64, data_size: i64) {
        let mut entries = self.entries.lock();
        match entries.get_mut(ident) {
            Some(entry) => entry.set(num_records, data_size),
            None => {
                entries.insert(ident.to_string(), Entry::new(num_records, data_size));
            }
        }
    }

    /// Cached (num records, data size); `(0, 0)` when unknown
    pub fn load_from_cache(&self, ident: &str) -> (i64, i64) {
        self.entries
            .lock()
            .get(ident)
            .map_or((0, 0), |e| (e.num_records, e.data_size))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// All entries as (identifier, num records, data size), sorted by identifier
    pub fn entries(&self) -> Vec<(String, i64, i64)> {
        let mut all: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.num_records, e.data_size))
            .collect();
        all.sort();
        all
    }

    /// Whether any entry changed since it was last written to disk
    pub fn is_dirty(&self) -> bool {
        self.entries.lock().values().any(|e| e.dirty)
    }

    /// Refresh tracked entries from their stores, optionally persisting
    ///
    /// The file is written after the entry lock is released, from a snapshot
    /// taken under it. Disk syncs run one at a time, so a later snapshot is
    /// never overwritten by an earlier one.
    pub fn sync_cache(&self, to_disk: bool) -> Result<()> {
        let _io = to_disk.then(|| self.io_lock.lock());
        let snapshot = {
            let mut entries = self.entries.lock();
            for (ident, entry) in entries.iter_mut() {
                let Some(weak) = &entry.store else {
                    continue;
                };
                match weak.upgrade() {
                    Some(store) => {
                        let num_records = store.num_records();
                        let data_size = store.data_size();
                        if num_records != entry.num_records || data_size != entry.data_size {
                            debug!(ident = %ident, num_records, data_size, "Size cache entry changed");
                            entry.set(num_records, data_size);
                        }
                    }
                    None => {
                        debug!(ident = %ident, "Tracked store is gone, keeping last values");
                        entry.store = None;
                    }
                }
            }
            if !to_disk {
                return Ok(());
            }
            entries
                .iter()
                .map(|(k, e)| (k.clone(), e.num_records, e.data_size))
                .collect::<Vec<_>>()
        };

        let buf = encode_entries(&snapshot);
        write_file_atomic(&self.path, &buf)?;

        let mut entries = self.entries.lock();
        for (ident, num_records, data_size) in &snapshot {
            if let Some(entry) = entries.get_mut(ident) {
                if entry.num_records == *num_records && entry.data_size == *data_size {
                    entry.dirty = false;
                }
            }
        }
        debug!(path = ?self.path, entries = snapshot.len(), bytes = buf.len(), "Synced size cache");
        Ok(())
    }

    /// Replace the cache with the file's content
    ///
    /// Never fails: a missing or unreadable file leaves an empty cache.
    /// Returns the number of entries loaded.
    pub fn fill_cache(&self) -> usize {
        let loaded = match std::fs::read(&self.path) {
            Ok(bytes) => match decode_entries(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = ?self.path, error = %e, "Size cache file is corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?self.path, "No size cache file, starting empty");
                HashMap::new()
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Failed to read size cache, starting empty");
                HashMap::new()
            }
        };

        let count = loaded.len();
        let mut fresh: HashMap<String, Entry> = loaded
            .into_iter()
            .map(|(ident, (num_records, data_size))| {
                let mut entry = Entry::new(num_records, data_size);
                entry.dirty = false;
                (ident, entry)
            })
            .collect();
        std::mem::swap(&mut *self.entries.lock(), &mut fresh);

        info!(path = ?self.path, entries = count, "Filled size cache");
        count
    }

    /// Sync to disk every `interval` on a blocking thread
    pub fn spawn_sync_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cache = Arc::clone(&cache);
                match tokio::task::spawn_blocking(move || cache.sync_cache(true)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Periodic size cache sync failed"),
                    Err(e) => warn!(error = %e, "Size cache sync task panicked"),
                }
            }
        })
    }
}

fn encode_entries(entries: &[(String, i64, i64)]) -> BytesMut {
    let keys: usize = entries.iter().map(|(k, _, _)| k.len()).sum();
    let mut buf = BytesMut::with_capacity(8 + keys + entries.len() * (4 + ENTRY_SIZE));
    buf.put_u64_le(entries.len() as u64);
    for (ident, num_records, data_size) in entries {
        buf.put_u32_le(ident.len() as u32);
        buf.put_slice(ident.as_bytes());
        buf.put_i64_le(*num_records);
        buf.put_i64_le(*data_size);
    }
    buf
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Corrupt(format!(
            "Size cache truncated reading {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn decode_entries(mut buf: &[u8]) -> Result<HashMap<String, (i64, i64)>> {
    need(buf, 8, "entry count")?;
    let count = buf.get_u64_le();

    let mut map = HashMap::new();
    for _ in 0..count {
        need(buf, 4, "key length")?;
        let len = buf.get_u32_le() as usize;
        need(buf, len + ENTRY_SIZE, "entry")?;
        let ident = String::from_utf8(buf[..len].to_vec());
        buf.advance(len);
        let num_records = buf.get_i64_le();
        let data_size = buf.get_i64_le();
        match ident {
            Ok(ident) => {
                map.insert(ident, (num_records, data_size));
            }
            Err(e) => warn!(key = ?e.as_bytes(), "Skipping size cache entry with non UTF-8 key"),
        }
    }

    if buf.has_remaining() {
        return Err(Error::Corrupt(format!(
            "Size cache has {} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FakeStore {
        ident: String,
        records: AtomicI64,
        size: AtomicI64,
    }

    impl FakeStore {
        fn new(ident: &str, records: i64, size: i64) -> Arc<Self> {
            Arc::new(Self {
                ident: ident.to_string(),
                records: AtomicI64::new(records),
                size: AtomicI64::new(size),
            })
        }
    }

    impl RecordStoreStats for FakeStore {
        fn ident(&self) -> String {
            self.ident.clone()
        }

        fn num_records(&self) -> i64 {
            self.records.load(Ordering::SeqCst)
        }

        fn data_size(&self) -> i64 {
            self.size.load(Ordering::SeqCst)
        }
    }

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("segdb_sizecache_{}_{}", name, std::process::id()))
    }

    #[test]
    fn test_sync_picks_up_growth_and_persists() -> Result<()> {
        let path = temp_file("growth");
        let cache = SizeCache::new(&path);
        let store = FakeStore::new("db.coll", 10, 100);

        cache.on_create(&store, 10, 100);
        cache.sync_cache(true)?;
        assert!(!cache.is_dirty());

        store.records.store(15, Ordering::SeqCst);
        cache.sync_cache(false)?;
        assert!(cache.is_dirty());
        assert_eq!(cache.load_from_cache("db.coll"), (15, 100));

        cache.sync_cache(true)?;
        let fresh = SizeCache::new(&path);
        assert_eq!(fresh.fill_cache(), 1);
        assert_eq!(fresh.load_from_cache("db.coll"), (15, 100));

        std::fs::remove_file(path).ok();
        Ok(())
    }

    #[test]
    fn test_destroy_pulls_final_values() {
        let cache = SizeCache::new(temp_file("destroy"));
        let store = FakeStore::new("rs", 100, 5000);

        cache.on_create(&store, 100, 5000);
        store.records.store(120, Ordering::SeqCst);
        store.size.store(6400, Ordering::SeqCst);
        cache.on_destroy(store.as_ref());

        assert_eq!(cache.load_from_cache("rs"), (120, 6400));
    }

    #[test]
    fn test_direct_entries_and_unknown() {
        let cache = SizeCache::new(temp_file("direct"));
        cache.store_to_cache("tbl1", 0, 0);
        assert_eq!(cache.load_from_cache("tbl1"), (0, 0));
        assert_eq!(cache.load_from_cache("unknown"), (0, 0));
        cache.store_to_cache("a", 2, 20);
        assert_eq!(cache.len(), 2);
        assert!(cache.is_dirty());
        assert_eq!(
            cache.entries(),
            vec![("a".to_string(), 2, 20), ("tbl1".to_string(), 0, 0)]
        );
    }

    #[test]
    fn test_dropped_store_keeps_last_values() -> Result<()> {
        let cache = SizeCache::new(temp_file("dropped"));
        let store = FakeStore::new("gone", 7, 70);
        cache.on_create(&store, 7, 70);
        drop(store);

        cache.sync_cache(false)?;
        assert_eq!(cache.load_from_cache("gone"), (7, 70));
        Ok(())
    }

    #[test]
    fn test_fill_missing_and_corrupt_files() -> Result<()> {
        let path = temp_file("corrupt");
        std::fs::remove_file(&path).ok();

        let cache = SizeCache::new(&path);
        cache.store_to_cache("stale", 1, 1);
        assert_eq!(cache.fill_cache(), 0);
        assert!(cache.is_empty());

        std::fs::write(&path, [3, 0, 0, 0, 0, 0, 0, 0, 9])?;
        cache.store_to_cache("stale", 1, 1);
        assert_eq!(cache.fill_cache(), 0);
        assert_eq!(cache.load_from_cache("stale"), (0, 0));

        std::fs::remove_file(path).ok();
        Ok(())
    }

    #[test]
    fn test_file_layout() -> Result<()> {
        let buf = encode_entries(&[("ab".to_string(), -1, 2)]);
        assert_eq!(buf.len(), 8 + 4 + 2 + ENTRY_SIZE);
        assert_eq!(&buf[..8], &1u64.to_le_bytes());
        assert_eq!(&buf[12..14], b"ab");

        let map = decode_entries(&buf)?;
        assert_eq!(map.get("ab"), Some(&(-1, 2)));
        assert!(decode_entries(&buf[..buf.len() - 1]).is_err());
        Ok(())
    }

    #[test]
    fn test_non_utf8_key_skips_only_that_entry() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(2);
        buf.put_u32_le(2);
        buf.put_slice(&[0xff, 0xfe]);
        buf.put_i64_le(1);
        buf.put_i64_le(1);
        buf.put_u32_le(4);
        buf.put_slice(b"good");
        buf.put_i64_le(5);
        buf.put_i64_le(50);

        let path = temp_file("utf8");
        std::fs::write(&path, &buf[..]).unwrap();
        let cache = SizeCache::new(&path);
        assert_eq!(cache.fill_cache(), 1);
        assert_eq!(cache.load_from_cache("good"), (5, 50));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_concurrent_disk_syncs() -> Result<()> {
        let path = temp_file("concurrent");
        let cache = Arc::new(SizeCache::new(&path));
        for i in 0..20 {
            cache.store_to_cache(&format!("t{}", i), i, i * 10);
        }

        let workers: Vec<_> = (0..8)
            .map(|n| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || -> Result<()> {
                    for _ in 0..10 {
                        cache.store_to_cache("moving", n, n);
                        cache.sync_cache(true)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("sync worker panicked")?;
        }

        cache.sync_cache(true)?;
        let fresh = SizeCache::new(&path);
        assert_eq!(fresh.fill_cache(), 21);
        assert_eq!(fresh.load_from_cache("moving"), cache.load_from_cache("moving"));
        assert!(!cache.is_dirty());

        std::fs::remove_file(path).ok();
        Ok(())
    }

    #[tokio::test]
    async fn test_periodic_sync_task() -> Result<()> {
        let path = temp_file("task");
        std::fs::remove_file(&path).ok();
        let cache = Arc::new(SizeCache::new(&path));
        cache.store_to_cache("t", 3, 30);

        let handle = cache.spawn_sync_task(Duration::from_millis(20));
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        let fresh = SizeCache::new(&path);
        fresh.fill_cache();
        assert_eq!(fresh.load_from_cache("t"), (3, 30));

        std::fs::remove_file(path).ok();
        Ok(())
    }
}
