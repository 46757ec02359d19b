// Restorable references: transparent re-establishment of server state after
// the transport drops and the session reconnects.

mod common;

use common::{start_server_with, CountingEngine, Relay};
use remora::engine::types::{
    ColumnDef, ColumnType, ColumnValue, DurabilityMode, LockMode, RowDescriptor,
};
use remora::{ClientConfig, Database, SessionStatus};
use std::sync::Arc;
use std::time::Duration;

async fn connect_via(relay: &Relay) -> Database {
    Database::connect(
        ClientConfig::new(relay.addr.to_string())
            .with_reconnect_delay(Duration::from_millis(50))
            .with_max_reconnect_attempts(20),
    )
    .await
    .expect("connect through relay")
}

async fn wait_connected(db: &Database) {
    for _ in 0..200 {
        if db.status() == SessionStatus::Connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("session did not reconnect in time");
}

#[tokio::test]
async fn test_restorable_open_index() {
    let engine = CountingEngine::new();
    let (server, addr) =
        start_server_with(engine.clone(), &[]).await;
    let relay = Relay::start(addr).await;
    let db = connect_via(&relay).await;

    let index = db.open_index(b"t").await.unwrap();
    index.store(None, b"k", Some(&b"v"[..])).await.unwrap();
    assert_eq!(engine.open_count(), 1);

    relay.sever();
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_connected(&db).await;

    // The restorable stub replayed its capture call against the new
    // session; operations on the same proxy keep working.
    assert_eq!(index.load(None, b"k").await.unwrap().unwrap(), b"v");
    assert_eq!(engine.open_count(), 2);

    // Canonical identity survives the reconnect.
    let found = db.find_index(b"t").await.unwrap().unwrap();
    assert_eq!(found, index);

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_transaction_survives_reconnect_by_resurrection() {
    let engine = CountingEngine::new();
    let (server, addr) =
        start_server_with(engine.clone(), &[]).await;
    let relay = Relay::start(addr).await;
    let db = connect_via(&relay).await;
    let index = db.open_index(b"txn-reconnect").await.unwrap();

    let txn = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    txn.set_lock_mode(LockMode::RepeatableRead).await.unwrap();
    txn.set_lock_timeout_nanos(500_000_000).await.unwrap();
    txn.id().await.unwrap();

    relay.sever();
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_connected(&db).await;

    // The old server transaction was detached and reset; the stub
    // resurrects a fresh one carrying the cached configuration.
    index.store(Some(&txn), b"k", Some(&b"v"[..])).await.unwrap();
    assert_eq!(txn.lock_mode().await.unwrap(), LockMode::RepeatableRead);
    assert_eq!(txn.lock_timeout_nanos().await.unwrap(), 500_000_000);
    txn.commit().await.unwrap();
    assert_eq!(index.load(None, b"k").await.unwrap().unwrap(), b"v");

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_cursor_resurrects_after_reconnect() {
    let engine = CountingEngine::new();
    let (server, addr) =
        start_server_with(engine.clone(), &[]).await;
    let relay = Relay::start(addr).await;
    let db = connect_via(&relay).await;
    let index = db.open_index(b"cursor-reconnect").await.unwrap();
    for (k, v) in [(&b"a"[..], &b"1"[..]), (&b"b"[..], &b"2"[..])] {
        index.store(None, k, Some(v)).await.unwrap();
    }

    let cursor = index.new_cursor(None).await.unwrap();
    cursor.first().await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"a");

    relay.sever();
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_connected(&db).await;

    // The cursor was torn down by the detach; the next operation builds a
    // new one from the view. The position was lost with the old session.
    cursor.first().await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"a");
    cursor.next().await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"b");

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_no_reconnect_surfaces_closed() {
    let engine = CountingEngine::new();
    let (server, addr) =
        start_server_with(engine.clone(), &[]).await;
    let relay = Relay::start(addr).await;

    let db = Database::connect(
        ClientConfig::new(relay.addr.to_string()).with_reconnect(false),
    )
    .await
    .unwrap();
    let index = db.open_index(b"dead-end").await.unwrap();
    index.store(None, b"k", Some(&b"v"[..])).await.unwrap();

    relay.sever();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(index.load(None, b"k").await.is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn test_derived_table_redrives_after_reconnect() {
    let engine = CountingEngine::new();
    let (server, addr) =
        start_server_with(engine.clone(), &[]).await;
    let relay = Relay::start(addr).await;
    let db = connect_via(&relay).await;

    let descriptor = Arc::new(RowDescriptor::new(vec![
        ColumnDef {
            name: "id".to_string(),
            type_code: ColumnType::Int64,
            key: true,
            nullable: false,
        },
        ColumnDef {
            name: "score".to_string(),
            type_code: ColumnType::Float64,
            key: false,
            nullable: false,
        },
    ]));
    let index = db.open_index(b"derived-reconnect").await.unwrap();
    let table = index.as_table(descriptor).await.unwrap();
    for (id, score) in [(1i64, 1.0f64), (2, 7.0), (3, 9.0)] {
        let mut row = table.new_row();
        row.set("id", ColumnValue::Int64(id)).unwrap();
        row.set("score", ColumnValue::Float64(score)).unwrap();
        table.store(None, &row).await.unwrap();
    }

    let derived = table
        .derive("score >= ?1", &[Some(ColumnValue::Float64(5.0))])
        .await
        .unwrap();

    relay.sever();
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_connected(&db).await;

    // The derived table re-drove its query and the handle/descriptor pair
    // was reinstalled.
    let mut scanner = derived.new_scanner(None, "*", &[]).await.unwrap();
    let mut ids = Vec::new();
    while let Some(row) = scanner.next_row().await.unwrap() {
        match row.get("id") {
            Some(ColumnValue::Int64(id)) => ids.push(*id),
            other => panic!("unexpected id column: {:?}", other),
        }
    }
    assert_eq!(ids, vec![2, 3]);

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_round_trip_preserves_tokens() {
    use remora::protocol::handshake::ConnectHeader;

    let header = ConnectHeader::new(&[0xAAAA, 0xBBBB]);
    let decoded = ConnectHeader::decode(&header.encode());
    assert_eq!(decoded.tokens, [0xAAAA, 0xBBBB]);
    assert!(decoded.accepts(&[0xBBBB]));
    assert!(!decoded.accepts(&[0xCCCC]));
}
