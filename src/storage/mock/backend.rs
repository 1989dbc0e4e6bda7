//! Factory wiring the mock stores and indexes into segments

use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::codec::CompressionAlgorithm;
use crate::storage::index::{IndexKey, ReadableIndex, WritableIndex};
use crate::storage::mock::{MockReadonlyIndex, MockReadonlyStore, MockWritableIndex, MockWritableStore};
use crate::storage::schema::{IndexSpec, KeyType};
use crate::storage::segment::StorageBackend;
use crate::storage::store::{ReadableStore, RowBatch, RowId, WritableStore};
use std::path::Path;
use std::sync::Arc;

/// Backend producing in-memory structures
#[derive(Debug, Clone, Copy)]
pub struct MockBackend {
    compression: CompressionAlgorithm,
    parallel_build_threshold: usize,
}

impl MockBackend {
    pub fn new(compression: CompressionAlgorithm, parallel_build_threshold: usize) -> Self {
        Self {
            compression,
            parallel_build_threshold,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.compression, config.parallel_build_threshold)
    }

    fn build_typed<K: IndexKey>(
        &self,
        spec: &IndexSpec,
        entries: Vec<(Vec<u8>, RowId)>,
    ) -> Result<Arc<dyn ReadableIndex>> {
        Ok(Arc::new(MockReadonlyIndex::<K>::build(
            spec.unique,
            entries,
            self.parallel_build_threshold,
            self.compression,
        )?))
    }

    fn open_typed<K: IndexKey>(&self, path: &Path) -> Result<Arc<dyn ReadableIndex>> {
        Ok(Arc::new(MockReadonlyIndex::<K>::open(path, self.compression)?))
    }

    fn create_typed<K: IndexKey>(&self, spec: &IndexSpec) -> Arc<dyn WritableIndex> {
        Arc::new(MockWritableIndex::<K>::new(spec.unique, self.compression))
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn build_store(&self, batch: RowBatch) -> Result<Arc<dyn ReadableStore>> {
        Ok(Arc::new(MockReadonlyStore::build(batch, self.compression)))
    }

    fn build_index(
        &self,
        spec: &IndexSpec,
        entries: Vec<(Vec<u8>, RowId)>,
    ) -> Result<Arc<dyn ReadableIndex>> {
        match spec.key_type {
            KeyType::Bytes => self.build_typed::<Vec<u8>>(spec, entries),
            KeyType::U64 => self.build_typed::<u64>(spec, entries),
            KeyType::I64 => self.build_typed::<i64>(spec, entries),
        }
    }

    fn open_store(&self, path: &Path) -> Result<Arc<dyn ReadableStore>> {
        Ok(Arc::new(MockReadonlyStore::open(path, self.compression)?))
    }

    fn open_index(&self, spec: &IndexSpec, path: &Path) -> Result<Arc<dyn ReadableIndex>> {
        match spec.key_type {
            KeyType::Bytes => self.open_typed::<Vec<u8>>(path),
            KeyType::U64 => self.open_typed::<u64>(path),
            KeyType::I64 => self.open_typed::<i64>(path),
        }
    }

    fn create_store(&self) -> Result<Arc<dyn WritableStore>> {
        Ok(Arc::new(MockWritableStore::new(self.compression)))
    }

    fn create_index(&self, spec: &IndexSpec) -> Result<Arc<dyn WritableIndex>> {
        Ok(match spec.key_type {
            KeyType::Bytes => self.create_typed::<Vec<u8>>(spec),
            KeyType::U64 => self.create_typed::<u64>(spec),
            KeyType::I64 => self.create_typed::<i64>(spec),
        })
    }

    fn compression(&self) -> CompressionAlgorithm {
        self.compression
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::context::DbContext;

    #[test]
    fn test_index_order_follows_key_type() -> Result<()> {
        let backend = MockBackend::new(CompressionAlgorithm::None, 1024);
        let mut ctx = DbContext::new();
        let entries = vec![
            (1i64.to_le_bytes().to_vec(), 0),
            ((-5i64).to_le_bytes().to_vec(), 1),
            (300i64.to_le_bytes().to_vec(), 2),
        ];

        let signed = backend.build_index(&IndexSpec::new("n", KeyType::I64, 0, None), entries.clone())?;
        let ids: Vec<RowId> = signed.iter_forward(&mut ctx).map(|(_, id)| id).collect();
        assert_eq!(ids, vec![1, 0, 2]);

        let bytes = backend.build_index(&IndexSpec::new("b", KeyType::Bytes, 0, Some(8)), entries)?;
        let ids: Vec<RowId> = bytes.iter_forward(&mut ctx).map(|(_, id)| id).collect();
        // little-endian bytes: 300 = [0x2c, 0x01, ..], 1 = [0x01, ..], -5 = [0xfb, ..]
        assert_eq!(ids, vec![0, 2, 1]);
        Ok(())
    }

    #[test]
    fn test_writable_index_rejects_bad_numeric_key() -> Result<()> {
        let backend = MockBackend::default();
        let index = backend.create_index(&IndexSpec::new("n", KeyType::U64, 0, None).unique())?;
        let mut ctx = DbContext::new();

        assert!(index.is_unique());
        assert!(index.insert(b"short", 1, &mut ctx).is_err());
        assert!(index.insert(&9u64.to_le_bytes(), 1, &mut ctx)?);
        Ok(())
    }
}
