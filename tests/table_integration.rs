//! End-to-end tests for composite tables over the in-memory backend

use segdb::error::{Error, Result};
use segdb::storage::{
    CompositeTable, CompressionAlgorithm, DbContext, IndexSpec, KeyType, MockBackend, RowId, SizeCache,
    StorageBackend, TableSchema,
};
use segdb::EngineConfig;
use std::sync::{Arc, Barrier};
use std::thread;

fn orders_schema() -> TableSchema {
    TableSchema::new(vec![
        IndexSpec::new("order_id", KeyType::U64, 0, None).unique(),
        IndexSpec::new("amount", KeyType::I64, 8, None),
        IndexSpec::new("customer", KeyType::Bytes, 16, None),
    ])
}

fn order(id: u64, amount: i64, customer: &str) -> Vec<u8> {
    let mut row = Vec::with_capacity(16 + customer.len());
    row.extend_from_slice(&id.to_le_bytes());
    row.extend_from_slice(&amount.to_le_bytes());
    row.extend_from_slice(customer.as_bytes());
    row
}

fn backend() -> Arc<dyn StorageBackend> {
    Arc::new(MockBackend::new(CompressionAlgorithm::Zstd, 16))
}

#[test]
fn test_table_lifecycle_on_disk() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("segdb_it_lifecycle_{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    let config = EngineConfig {
        freeze_threshold_rows: 50,
        ..EngineConfig::default()
    };

    let expected = {
        let table = CompositeTable::create("orders", Some(&dir), orders_schema(), backend(), &config)?;
        let mut ctx = table.create_db_context();
        for i in 0..120u64 {
            let customer = format!("c{}", i % 9);
            table.append(&order(i, (i as i64 % 13) - 6, &customer), &mut ctx)?;
            table.maybe_freeze()?;
        }
        assert_eq!(table.num_segments(), 3);

        // live segment rows can still change
        let live_id: RowId = 110;
        table.replace(live_id, &order(110, 1000, "vip"), &mut ctx)?;
        table.remove(111, &mut ctx)?;
        table.flush()?;

        table.iter_forward(&mut ctx).collect::<Vec<_>>()
    };

    let table = CompositeTable::open(&dir, backend(), &config)?;
    let mut ctx = table.create_db_context();
    assert_eq!(table.iter_forward(&mut ctx).collect::<Vec<_>>(), expected);
    assert_eq!(table.num_rows(), 119);
    assert_eq!(table.search_exact(2, b"vip", &mut ctx)?, Some(110));
    assert_eq!(table.search_exact(0, &111u64.to_le_bytes(), &mut ctx)?, None);

    let amounts: Vec<i64> = table
        .index_iter_forward(1, &mut ctx)?
        .map(|(k, _)| i64::from_le_bytes(k.as_slice().try_into().unwrap()))
        .collect();
    assert_eq!(amounts.len(), 119);
    assert!(amounts.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(amounts.first(), Some(&-6));
    assert_eq!(amounts.last(), Some(&1000));

    std::fs::remove_dir_all(dir).ok();
    Ok(())
}

#[test]
fn test_duplicate_key_rolls_back_whole_append() -> Result<()> {
    let table = CompositeTable::create("t", None, orders_schema(), backend(), &EngineConfig::default())?;
    let mut ctx = table.create_db_context();

    table.append(&order(1, 10, "a"), &mut ctx)?;
    let before: Vec<_> = table.index_iter_forward(2, &mut ctx)?.collect();
    let size_before = table.total_storage_size();

    let err = table.append(&order(1, 20, "b"), &mut ctx).unwrap_err();
    assert!(matches!(err, Error::DuplicateKey(_)));
    assert!(err.is_recoverable());

    assert_eq!(table.index_iter_forward(2, &mut ctx)?.collect::<Vec<_>>(), before);
    assert_eq!(table.total_storage_size(), size_before);
    assert_eq!(table.num_rows(), 1);
    Ok(())
}

#[test]
fn test_concurrent_readers_during_freeze() -> Result<()> {
    let table = Arc::new(CompositeTable::create(
        "busy",
        None,
        orders_schema(),
        backend(),
        &EngineConfig::default(),
    )?);
    {
        let mut ctx = table.create_db_context();
        for i in 0..200u64 {
            table.append(&order(i, i as i64, "x"), &mut ctx)?;
        }
    }

    let readers = 4;
    let started = Arc::new(Barrier::new(readers + 1));
    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let table = Arc::clone(&table);
            let started = Arc::clone(&started);
            thread::spawn(move || -> Result<()> {
                let mut ctx = table.create_db_context();
                let check = |ctx: &mut DbContext| -> Result<()> {
                    // every chain a reader can see exposes each row exactly once
                    let ids: Vec<RowId> = table.iter_forward(ctx).map(|(id, _)| id).collect();
                    assert_eq!(ids, (0..200).collect::<Vec<_>>());
                    assert_eq!(table.search_exact(0, &150u64.to_le_bytes(), ctx)?, Some(150));
                    Ok(())
                };

                check(&mut ctx)?;
                assert_eq!(ctx.chain_version(), Some(1));
                started.wait();

                // keep reading until the frozen chain has been observed
                while ctx.chain_version() == Some(1) {
                    check(&mut ctx)?;
                }
                check(&mut ctx)?;
                assert_eq!(ctx.chain_version(), Some(2));
                Ok(())
            })
        })
        .collect();

    started.wait();
    table.freeze()?;
    for handle in handles {
        handle.join().expect("reader panicked")?;
    }
    assert_eq!(table.num_segments(), 2);
    Ok(())
}

#[test]
fn test_create_rejects_mis_sized_numeric_key() {
    let schema = TableSchema::new(vec![IndexSpec::new("short_id", KeyType::U64, 0, Some(4))]);
    let dir = std::env::temp_dir().join(format!("segdb_it_badschema_{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();

    let result = CompositeTable::create("bad", Some(&dir), schema, backend(), &EngineConfig::default());
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert!(!dir.exists());
}

#[test]
fn test_table_registered_in_size_cache() -> Result<()> {
    let path = std::env::temp_dir().join(format!("segdb_it_cache_{}", std::process::id()));
    let cache = SizeCache::new(&path);
    let table = Arc::new(CompositeTable::create(
        "db.orders",
        None,
        orders_schema(),
        backend(),
        &EngineConfig::default(),
    )?);

    cache.on_create(&table, 0, 0);
    let mut ctx = table.create_db_context();
    for i in 0..10u64 {
        table.append(&order(i, 0, "z"), &mut ctx)?;
    }
    cache.sync_cache(false)?;
    let (rows, size) = cache.load_from_cache("db.orders");
    assert_eq!(rows, 10);
    assert_eq!(size, table.data_size() as i64);

    table.freeze()?;
    table.append(&order(99, 0, "z"), &mut ctx)?;
    cache.on_destroy(table.as_ref());
    drop(table);

    cache.sync_cache(true)?;
    let reloaded = SizeCache::new(&path);
    reloaded.fill_cache();
    assert_eq!(reloaded.load_from_cache("db.orders").0, 11);

    std::fs::remove_file(path).ok();
    Ok(())
}
