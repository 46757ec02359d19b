// Session establishment, handle lifecycle, and transaction semantics over
// real localhost TCP.

mod common;

use common::start_server;
use remora::engine::types::{DurabilityMode, LockMode, LockResult, TimeUnit};
use remora::engine::CursorValue;
use remora::{ClientConfig, Database, RemoteError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

async fn connect(addr: std::net::SocketAddr, tokens: &[u64]) -> Database {
    Database::connect(ClientConfig::new(addr.to_string()).with_tokens(&tokens.to_vec()))
        .await
        .expect("connect")
}

#[tokio::test]
async fn test_open_close_with_token_overlap() {
    // Server accepts {B, C}; the client presents {A, B} and B matches.
    let (server, addr) = start_server(&[20, 30]).await;
    let db = connect(addr, &[10, 20]).await;

    let index = db.open_index(b"test").await.unwrap();
    assert_ne!(index.id(), 0);

    let found = db.find_index(b"test").await.unwrap().unwrap();
    assert_eq!(found, index);

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_rejected_without_matching_token() {
    let (server, addr) = start_server(&[42]).await;
    let result = Database::connect(
        ClientConfig::new(addr.to_string())
            .with_tokens(&[7])
            .with_reconnect(false),
    )
    .await;
    assert!(result.is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn test_unauthenticated_accept() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    assert!(!db.is_closed().await.unwrap());
    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_canonical_instances() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;

    let a = db.open_index(b"people").await.unwrap();
    let b = db.open_index(b"people").await.unwrap();
    assert_eq!(a, b);

    let by_id = db.index_by_id(a.id()).await.unwrap().unwrap();
    assert_eq!(by_id, a);

    let registry_a = db.registry().await.unwrap();
    let registry_b = db.registry().await.unwrap();
    assert_eq!(registry_a, registry_b);

    let bogus_a = db.bogus().await.unwrap();
    let bogus_b = db.bogus().await.unwrap();
    assert_eq!(bogus_a, bogus_b);
    assert!(bogus_a.is_bogus());

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_store_load_round_trip() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"kv").await.unwrap();

    index.store(None, b"k", Some(&b"v"[..])).await.unwrap();
    assert_eq!(index.load(None, b"k").await.unwrap().unwrap(), b"v");
    assert!(index.exists(None, b"k").await.unwrap());
    assert_eq!(index.count(None, None).await.unwrap(), 1);
    assert!(!index.is_empty().await.unwrap());

    assert!(index.insert(None, b"k2", Some(&b"x"[..])).await.unwrap());
    assert!(!index.insert(None, b"k2", Some(&b"y"[..])).await.unwrap());
    assert!(index.replace(None, b"k2", Some(&b"y"[..])).await.unwrap());
    assert_eq!(
        index.exchange(None, b"k2", Some(&b"z"[..])).await.unwrap().unwrap(),
        b"y"
    );
    assert!(index
        .update_with_old(None, b"k2", Some(&b"z"[..]), Some(&b"w"[..]))
        .await
        .unwrap());
    assert!(index.remove(None, b"k2", Some(&b"w"[..])).await.unwrap());
    assert!(index.delete(None, b"k").await.unwrap());
    assert!(index.is_empty().await.unwrap());

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_cursor_scan_scenario() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"scan").await.unwrap();
    for (k, v) in [
        (&b"k1"[..], &b"v1"[..]),
        (&b"k2"[..], &b"v2"[..]),
        (&b"k3"[..], &b"v3"[..]),
    ] {
        index.store(None, k, Some(v)).await.unwrap();
    }

    let cursor = index.new_cursor(None).await.unwrap();
    let mut seen = Vec::new();
    cursor.first().await.unwrap();
    while let Some(key) = cursor.key() {
        let value = cursor.value().into_option().unwrap();
        seen.push((key, value));
        cursor.next().await.unwrap();
    }
    assert_eq!(
        seen,
        vec![
            (b"k1".to_vec(), b"v1".to_vec()),
            (b"k2".to_vec(), b"v2".to_vec()),
            (b"k3".to_vec(), b"v3".to_vec()),
        ]
    );

    cursor.last().await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"k3");
    assert_eq!(cursor.value(), CursorValue::Bytes(b"v3".to_vec()));
    cursor.previous().await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"k2");

    // Bounded and seek moves.
    cursor.find_ge(b"k1x").await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"k2");
    cursor.next_lt(b"k3").await.unwrap();
    assert!(cursor.key().is_none());
    cursor.find(b"k1").await.unwrap();
    cursor.skip(2).await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"k3");
    assert_eq!(cursor.compare_key_to(b"k2").unwrap(), std::cmp::Ordering::Greater);

    cursor.reset().await.unwrap();
    assert!(cursor.key().is_none());
    // A reset cursor resurrects on the next operation.
    cursor.first().await.unwrap();
    assert_eq!(cursor.key().unwrap(), b"k1");

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_cursor_autoload_sentinel() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"sentinel").await.unwrap();
    index.store(None, b"k", Some(&b"v"[..])).await.unwrap();

    let cursor = index.new_cursor(None).await.unwrap();
    cursor.set_autoload(false).await.unwrap();
    cursor.first().await.unwrap();
    assert_eq!(cursor.value(), CursorValue::NotLoaded);
    cursor.load().await.unwrap();
    assert_eq!(cursor.value(), CursorValue::Bytes(b"v".to_vec()));

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_transaction_basics() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"txn").await.unwrap();

    let txn = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    index.store(Some(&txn), b"k", Some(&b"v"[..])).await.unwrap();
    txn.commit().await.unwrap();
    assert_eq!(index.load(None, b"k").await.unwrap().unwrap(), b"v");

    // Rollback by exit.
    let txn = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    index.store(Some(&txn), b"k", Some(&b"other"[..])).await.unwrap();
    txn.exit().await.unwrap();
    assert_eq!(index.load(None, b"k").await.unwrap().unwrap(), b"v");

    // Nesting depth mirrors enter/exit.
    let txn = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    assert_eq!(txn.nesting_depth(), 0);
    txn.enter().await.unwrap();
    txn.enter().await.unwrap();
    assert_eq!(txn.nesting_depth(), 2);
    txn.exit().await.unwrap();
    txn.exit().await.unwrap();
    assert_eq!(txn.nesting_depth(), 0);
    txn.reset().await.unwrap();

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_transaction_resurrection_scenario() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"resurrect").await.unwrap();

    let txn = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    txn.set_lock_mode(LockMode::RepeatableRead).await.unwrap();
    txn.set_lock_timeout(1, TimeUnit::Seconds).await.unwrap();
    txn.reset().await.unwrap();

    // The next operation builds a new server transaction carrying the
    // cached lock mode and timeout.
    let result = txn.lock_exclusive(index.id(), b"key").await.unwrap();
    assert_eq!(result, LockResult::Acquired);
    assert_eq!(txn.lock_mode().await.unwrap(), LockMode::RepeatableRead);
    assert_eq!(txn.lock_timeout(TimeUnit::Seconds).await.unwrap(), 1);

    // The replayed configuration is live on the server: a conflicting
    // transaction times out.
    let other = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    let blocked = other
        .try_lock_shared(index.id(), b"key", 2_000_000)
        .await
        .unwrap();
    assert_eq!(blocked, LockResult::TimedOutLock);

    txn.reset().await.unwrap();
    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_reset_cause_borks() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;

    let txn = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    txn.id().await.unwrap();
    txn.reset_cause("poisoned by test").await.unwrap();
    let err = txn.check().await.unwrap_err();
    assert!(matches!(err, RemoteError::InvalidTransaction { .. }));
    let err = txn.enter().await.unwrap_err();
    assert!(matches!(err, RemoteError::InvalidTransaction { .. }));

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_bogus_cannot_enter() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let bogus = db.bogus().await.unwrap();
    let err = bogus.enter().await.unwrap_err();
    assert!(matches!(err, RemoteError::IllegalState { .. }));
    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_cursor_linked_txn() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"linked").await.unwrap();
    index.store(None, b"k", Some(&b"v"[..])).await.unwrap();

    let txn = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    txn.set_lock_mode(LockMode::RepeatableRead).await.unwrap();
    let cursor = index.new_cursor(Some(&txn)).await.unwrap();
    let lock = cursor.first().await.unwrap();
    assert!(lock.is_held());
    txn.reset().await.unwrap();

    // Relinking to no transaction takes effect before the next move.
    cursor.link(None).await.unwrap();
    let lock = cursor.first().await.unwrap();
    assert_eq!(lock, LockResult::Unowned);

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_registry_views() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"registered").await.unwrap();

    let registry = db.registry().await.unwrap();
    let name = registry
        .load(None, &index.id().to_be_bytes())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, b"registered");

    let key_map = db.registry_key_map().await.unwrap();
    let id = key_map.load(None, b"registered").await.unwrap().unwrap();
    assert_eq!(id, index.id().to_be_bytes());

    // Registry views refuse modification.
    let err = registry.store(None, b"x", Some(&b"y"[..])).await.unwrap_err();
    assert!(matches!(err, RemoteError::ViewConstraint { .. }));
    assert!(registry.is_unmodifiable().await.unwrap());

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_rename_and_delete_index() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"old-name").await.unwrap();
    index.store(None, b"k", Some(&b"v"[..])).await.unwrap();

    db.rename_index(&index, b"new-name").await.unwrap();
    assert!(db.find_index(b"new-name").await.unwrap().is_some());

    let deletion = db.delete_index(&index).await.unwrap();
    deletion.run().await.unwrap();
    assert!(db.find_index(b"new-name").await.unwrap().is_none());

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_writers() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;

    let custom = db.custom_writer("audit").await.unwrap();
    let again = db.custom_writer("audit").await.unwrap();
    assert_eq!(custom, again);

    let txn = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    custom.write(&txn, b"payload").await.unwrap();

    let prepare = db.prepare_writer("two-phase").await.unwrap();
    prepare.write(&txn, b"prep").await.unwrap();
    txn.commit().await.unwrap();

    // A bogus transaction cannot carry handler writes.
    let bogus = db.bogus().await.unwrap();
    assert!(custom.write(&bogus, b"x").await.is_err());

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_leader_callbacks() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;

    assert!(db.is_leader().await.unwrap());
    let acquired = Arc::new(AtomicBool::new(false));
    let lost = Arc::new(AtomicBool::new(false));
    let a = acquired.clone();
    let l = lost.clone();
    db.upon_leader(
        move || a.store(true, Ordering::Release),
        move || l.store(true, Ordering::Release),
    )
    .await
    .unwrap();

    // Level-triggered acquisition: already leader, fires immediately.
    common::eventually(|| acquired.load(Ordering::Acquire)).await;
    assert!(!lost.load(Ordering::Acquire));

    // Edge-triggered loss fires once on failover.
    db.failover().await.unwrap();
    common::eventually(|| lost.load(Ordering::Acquire)).await;
    assert!(!db.is_leader().await.unwrap());

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_surfaces() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;

    for result in [
        db.suspend_checkpoints(),
        db.resume_checkpoints(),
        db.acquire_commit_lock(),
        db.register_custom_handler("x"),
        db.register_prepare_handler("x"),
    ] {
        match result.unwrap_err() {
            RemoteError::Unsupported { message, .. } => {
                assert!(!message.is_empty());
            }
            other => panic!("expected unsupported, got {}", other),
        }
    }

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_stats_and_maintenance_ops() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"stats").await.unwrap();
    index.store(None, b"k", Some(&b"v"[..])).await.unwrap();

    let stats = db.stats().await.unwrap();
    assert_eq!(stats.page_size, 4096);
    assert!(stats.open_indexes >= 1);

    db.flush().await.unwrap();
    db.sync().await.unwrap();
    db.checkpoint().await.unwrap();
    db.preallocate(1 << 20).await.unwrap();
    db.set_capacity_limit(1 << 30).await.unwrap();
    assert_eq!(db.capacity_limit().await.unwrap(), 1 << 30);

    let primer = db.create_cache_primer().await.unwrap();
    db.apply_cache_primer(&primer).await.unwrap();

    let index_stats = index.analyze().await.unwrap();
    assert_eq!(index_stats.entry_count, 1);

    db.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_lock_errors_carry_frames() {
    let (server, addr) = start_server(&[]).await;
    let db = connect(addr, &[]).await;
    let index = db.open_index(b"frames").await.unwrap();

    let holder = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    index.store(Some(&holder), b"k", Some(&b"v"[..])).await.unwrap();

    let waiter = db.new_transaction(DurabilityMode::Sync).await.unwrap();
    waiter.set_lock_timeout_nanos(2_000_000).await.unwrap();
    let err = index.load(Some(&waiter), b"k").await.unwrap_err();
    match &err {
        RemoteError::LockTimeout { frames, .. } => {
            assert!(!frames.is_empty());
        }
        other => panic!("expected lock timeout, got {}", other),
    }

    holder.reset().await.unwrap();
    waiter.reset().await.unwrap();
    db.close().await.unwrap();
    server.shutdown().await;
}
