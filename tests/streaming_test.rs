// Bulk streaming paths: value streams, sorter ingest and drain, snapshot
// transfer, typed tables, and the observer relays.

mod common;

use common::start_server;
use remora::engine::types::{ColumnDef, ColumnType, ColumnValue, QueryPlan, RowDescriptor};
use remora::error::Result;
use remora::{ClientConfig, CompactionObserver, Database, VerificationObserver};
use std::sync::Arc;

async fn connect(addr: std::net::SocketAddr) -> Database {
    Database::connect(ClientConfig::new(addr.to_string()))
        .await
        .expect("connect")
}

fn people_descriptor() -> Arc<RowDescriptor> {
    Arc::new(RowDescriptor::new(vec![
        ColumnDef {
            name: "id".to_string(),
            type_code: ColumnType::Int64,
            key: true,
            nullable: false,
        },
        ColumnDef {
            name: "name".to_string(),
            type_code: ColumnType::Utf8,
            key: false,
            nullable: false,
        },
        ColumnDef {
            name: "score".to_string(),
            type_code: ColumnType::Float64,
            key: false,
            nullable: true,
        },
    ]))
}

#[tokio::test]
async fn test_value_stream_round_trip() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"values").await.unwrap();
    index.store(None, b"big", Some(&b""[..])).await.unwrap();

    // 200 KB of patterned bytes through the output stream.
    let payload: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
    let cursor = index.new_cursor(None).await.unwrap();
    cursor.find(b"big").await.unwrap();
    let mut out = cursor.new_value_output_stream(0).await.unwrap();
    for chunk in payload.chunks(4096) {
        out.write(chunk).await.unwrap();
    }
    out.close().await.unwrap();

    assert_eq!(cursor.value_length().await.unwrap(), payload.len() as i64);

    // Read it back through the input stream.
    let mut input = cursor.new_value_input_stream(0, 4096).await.unwrap();
    let mut echoed = Vec::new();
    input.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_value_stream_flush_ack() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"flush").await.unwrap();
    index.store(None, b"k", Some(&b""[..])).await.unwrap();

    let cursor = index.new_cursor(None).await.unwrap();
    cursor.find(b"k").await.unwrap();
    let mut out = cursor.new_value_output_stream(0).await.unwrap();
    out.write(b"hello").await.unwrap();
    out.flush().await.unwrap();
    out.write(b" world").await.unwrap();
    out.close().await.unwrap();

    assert_eq!(
        index.load(None, b"k").await.unwrap().unwrap(),
        b"hello world"
    );

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_value_random_access_ops() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"random-access").await.unwrap();
    index.store(None, b"k", Some(&b"0123456789"[..])).await.unwrap();

    let cursor = index.new_cursor(None).await.unwrap();
    cursor.find(b"k").await.unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(cursor.value_read(3, &mut buf).await.unwrap(), 4);
    assert_eq!(&buf, b"3456");
    assert_eq!(cursor.value_read(100, &mut buf).await.unwrap(), -1);

    cursor.value_write(10, b"ABCD").await.unwrap();
    assert_eq!(cursor.value_length().await.unwrap(), 14);
    cursor.value_clear(0, 2).await.unwrap();
    cursor.set_value_length(12).await.unwrap();
    let value = index.load(None, b"k").await.unwrap().unwrap();
    assert_eq!(&value, b"\0\023456789AB");

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_sorter_pipeline() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;

    let sorter = db.new_sorter().await.unwrap();
    sorter.add(b"m", b"13").await.unwrap();

    let batch: Vec<(Vec<u8>, Vec<u8>)> = (0..100u32)
        .map(|i| {
            (
                format!("b{:03}", 99 - i).into_bytes(),
                i.to_string().into_bytes(),
            )
        })
        .collect();
    sorter.add_batch(&batch).await.unwrap();

    sorter
        .add_all((0..50u32).map(|i| {
            (
                format!("a{:03}", 49 - i).into_bytes(),
                i.to_string().into_bytes(),
            )
        }))
        .await
        .unwrap();

    let (added, _) = sorter.progress().await.unwrap();
    assert_eq!(added, 151);

    let index = sorter.finish().await.unwrap();
    assert_eq!(index.count(None, None).await.unwrap(), 151);
    let cursor = index.new_cursor(None).await.unwrap();
    cursor.first().await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"a000");
    cursor.last().await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"m");

    // A finished sorter rejects further input until reset.
    assert!(sorter.add(b"x", b"y").await.is_err());
    sorter.reset().await.unwrap();
    sorter.add(b"z", b"26").await.unwrap();
    let drained = sorter.finish_scan(true).await.unwrap();
    assert_eq!(drained, vec![(b"z".to_vec(), b"26".to_vec())]);

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_transfer() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"snap").await.unwrap();
    for i in 0..32u32 {
        index
            .store(None, format!("k{:02}", i).as_bytes(), Some(&i.to_le_bytes()))
            .await
            .unwrap();
    }

    let snapshot = db.begin_snapshot().await.unwrap();
    let expected = snapshot.length();
    assert!(expected > 0);
    assert_eq!(snapshot.position(), 0);

    let mut out = Vec::new();
    let transferred = snapshot.write_to(&mut out).await.unwrap();
    assert_eq!(transferred, expected);
    assert_eq!(out.len() as u64, expected);

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_table_point_ops() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"people").await.unwrap();
    let table = index.as_table(people_descriptor()).await.unwrap();

    let mut row = table.new_row();
    row.set("id", ColumnValue::Int64(1)).unwrap();
    row.set("name", ColumnValue::Utf8("ada".to_string())).unwrap();
    row.set("score", ColumnValue::Float64(9.5)).unwrap();

    assert!(table.insert(None, &row).await.unwrap());
    assert!(table.exists(None, &row).await.unwrap());
    let loaded = table.load(None, &row).await.unwrap().unwrap();
    assert_eq!(loaded.get("name"), Some(&ColumnValue::Utf8("ada".into())));
    assert_eq!(loaded.get("score"), Some(&ColumnValue::Float64(9.5)));

    // Dirty-column update through the compiled proxy.
    let mut patch = table.new_row();
    patch.set("id", ColumnValue::Int64(1)).unwrap();
    patch.set("score", ColumnValue::Float64(2.5)).unwrap();
    assert!(table.update(None, &patch, &["score"]).await.unwrap());
    let merged = table.merge(None, &patch, &["score"]).await.unwrap().unwrap();
    assert_eq!(merged.get("score"), Some(&ColumnValue::Float64(2.5)));
    assert_eq!(merged.get("name"), Some(&ColumnValue::Utf8("ada".into())));

    assert!(table.delete(None, &row).await.unwrap());
    assert!(!table.exists(None, &row).await.unwrap());

    db.close().await.unwrap();
    server.shutdown().await;
}

async fn seed_people(table: &remora::Table) -> Result<()> {
    for (id, name, score) in [
        (1i64, "ada", 9.5f64),
        (2, "bob", 3.0),
        (3, "cyd", 8.0),
        (4, "dee", 5.5),
    ] {
        let mut row = table.new_row();
        row.set("id", ColumnValue::Int64(id)).unwrap();
        row.set("name", ColumnValue::Utf8(name.to_string())).unwrap();
        row.set("score", ColumnValue::Float64(score)).unwrap();
        table.store(None, &row).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_scanner_with_pushdown() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"scanning").await.unwrap();
    let table = index.as_table(people_descriptor()).await.unwrap();
    seed_people(&table).await.unwrap();

    assert_eq!(table.validate("score >= ?1 && name != ?2").await.unwrap(), 2);

    let mut scanner = table
        .new_scanner(None, "score >= ?1", &[Some(ColumnValue::Float64(5.0))])
        .await
        .unwrap();
    assert!(scanner.is_ordered());
    let mut names = Vec::new();
    while let Some(row) = scanner.next_row().await.unwrap() {
        match row.get("name") {
            Some(ColumnValue::Utf8(name)) => names.push(name.clone()),
            other => panic!("unexpected name column: {:?}", other),
        }
    }
    assert_eq!(names, vec!["ada", "cyd", "dee"]);

    match table.scanner_plan("score >= ?1", false).await.unwrap() {
        QueryPlan::Filter { expression, child } => {
            assert_eq!(expression, "score >= ?1");
            assert!(matches!(*child, QueryPlan::FullScan { .. }));
        }
        other => panic!("unexpected plan: {:?}", other),
    }

    assert!(table
        .any_rows(None, "name == ?1", &[Some(ColumnValue::Utf8("bob".into()))])
        .await
        .unwrap());
    assert!(!table
        .any_rows(None, "name == ?1", &[Some(ColumnValue::Utf8("zed".into()))])
        .await
        .unwrap());

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_updater_stream() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"updating").await.unwrap();
    let table = index.as_table(people_descriptor()).await.unwrap();
    seed_people(&table).await.unwrap();

    let mut updater = table
        .new_updater(None, "score <= ?1", &[Some(ColumnValue::Float64(6.0))])
        .await
        .unwrap();

    // bob (3.0) and dee (5.5) match; double bob's score, delete dee.
    let row = updater.row().expect("first row").clone();
    assert_eq!(row.get("name"), Some(&ColumnValue::Utf8("bob".into())));
    let mut patch = row.clone();
    patch.set("score", ColumnValue::Float64(6.0)).unwrap();
    updater.update(&patch, &["score"]).await.unwrap();

    let row = updater.row().expect("second row").clone();
    assert_eq!(row.get("name"), Some(&ColumnValue::Utf8("dee".into())));
    assert!(updater.delete().await.unwrap().is_none());
    updater.close().await.unwrap();

    let mut probe = table.new_row();
    probe.set("id", ColumnValue::Int64(2)).unwrap();
    let bob = table.load(None, &probe).await.unwrap().unwrap();
    assert_eq!(bob.get("score"), Some(&ColumnValue::Float64(6.0)));
    probe.set("id", ColumnValue::Int64(4)).unwrap();
    assert!(table.load(None, &probe).await.unwrap().is_none());

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_derived_table() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"deriving").await.unwrap();
    let table = index.as_table(people_descriptor()).await.unwrap();
    seed_people(&table).await.unwrap();

    let derived = table
        .derive("{name}: score >= ?1", &[Some(ColumnValue::Float64(8.0))])
        .await
        .unwrap();
    let descriptor = derived.descriptor().await.unwrap();
    // Projection keeps the key column plus the named column.
    assert_eq!(descriptor.columns.len(), 2);
    assert_eq!(descriptor.columns[1].name, "name");

    let mut scanner = derived.new_scanner(None, "*", &[]).await.unwrap();
    let mut names = Vec::new();
    while let Some(row) = scanner.next_row().await.unwrap() {
        match row.get("name") {
            Some(ColumnValue::Utf8(name)) => names.push(name.clone()),
            other => panic!("unexpected name column: {:?}", other),
        }
    }
    assert_eq!(names, vec!["ada", "cyd"]);
    assert!(!derived.is_empty().await.unwrap());

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_query_error_span() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"bad-query").await.unwrap();
    let table = index.as_table(people_descriptor()).await.unwrap();

    let err = table.validate("nosuch == ?1").await.unwrap_err();
    match err {
        remora::RemoteError::Query { start, end, .. } => {
            assert_eq!(start, 0);
            assert_eq!(end, 6);
        }
        other => panic!("expected query error, got {}", other),
    }

    db.close().await.unwrap();
    server.shutdown().await;
}

struct CountingVerifier {
    passed: u64,
    failed: u64,
}

impl VerificationObserver for CountingVerifier {
    fn wants_nodes(&self) -> bool {
        true
    }

    fn node_passed(&mut self, _: u64, _: u8, _: u32, _: u32, _: u32) -> Result<bool> {
        self.passed += 1;
        Ok(true)
    }

    fn node_failed(&mut self, _: u64, _: u8, _: &str) -> Result<bool> {
        self.failed += 1;
        Ok(true)
    }
}

#[tokio::test]
async fn test_verification_observer_scenario() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"verified").await.unwrap();

    // Bulk-load 10 000 entries through a sorter, then verify the index.
    let sorter = db.new_sorter().await.unwrap();
    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..10_000u32)
        .map(|i| (format!("key{:05}", i).into_bytes(), b"v".to_vec()))
        .collect();
    sorter.add_batch(&entries).await.unwrap();
    let loaded = sorter.finish_scan(false).await.unwrap();
    for (k, v) in loaded {
        index.store(None, &k, Some(&v)).await.unwrap();
    }

    let mut observer = CountingVerifier {
        passed: 0,
        failed: 0,
    };
    let passed = index.verify(Some(&mut observer)).await.unwrap();
    assert!(passed);
    assert_eq!(observer.passed, 10_000);
    assert_eq!(observer.failed, 0);

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_database_verify_without_observer() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"plain-verify").await.unwrap();
    index.store(None, b"k", Some(&b"v"[..])).await.unwrap();
    assert!(db.verify(None).await.unwrap());
    server.shutdown().await;
    let _ = db;
}

struct CountingCompactor {
    visited: u64,
}

impl CompactionObserver for CountingCompactor {
    fn wants_nodes(&self) -> bool {
        true
    }

    fn node_visited(&mut self, _: u64) -> Result<bool> {
        self.visited += 1;
        Ok(true)
    }
}

#[tokio::test]
async fn test_compaction_observer() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"compacted").await.unwrap();
    for i in 0..64u32 {
        index
            .store(None, format!("k{:02}", i).as_bytes(), Some(&b"v"[..]))
            .await
            .unwrap();
    }

    let mut observer = CountingCompactor { visited: 0 };
    let compacted = db.compact_file(Some(&mut observer), 0.5).await.unwrap();
    assert!(compacted);
    assert_eq!(observer.visited, 64);

    db.close().await.unwrap();
    server.shutdown().await;
}

struct FailingVerifier;

impl VerificationObserver for FailingVerifier {
    fn wants_nodes(&self) -> bool {
        true
    }

    fn node_passed(&mut self, id: u64, _: u8, _: u32, _: u32, _: u32) -> Result<bool> {
        if id >= 3 {
            Err(remora::RemoteError::illegal_state("observer gave up"))
        } else {
            Ok(true)
        }
    }

    fn node_failed(&mut self, _: u64, _: u8, _: &str) -> Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn test_observer_error_held_and_rethrown() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr).await;
    let index = db.open_index(b"held").await.unwrap();
    for i in 0..10u32 {
        index
            .store(None, format!("k{}", i).as_bytes(), Some(&b"v"[..]))
            .await
            .unwrap();
    }

    let mut observer = FailingVerifier;
    let err = index.verify(Some(&mut observer)).await.unwrap_err();
    assert!(matches!(err, remora::RemoteError::IllegalState { .. }));

    // The session survives a held observer error.
    assert_eq!(index.load(None, b"k1").await.unwrap().unwrap(), b"v");

    db.close().await.unwrap();
    server.shutdown().await;
}
