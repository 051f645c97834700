mod common;

use bytes::Bytes;
use common::*;
use lightning_txn::{
    Error, IsolationLevel, LockType, TransactionConfig, TransactionEvent, TransactionId,
    TransactionOptions, TransactionState,
};
use std::time::Duration;

fn opts(level: IsolationLevel) -> TransactionOptions {
    TransactionOptions::default().with_isolation(level)
}

#[tokio::test]
async fn test_committed_write_visible_to_next_transaction() {
    let (tm, _store) = local_manager();

    let t1 = tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();
    tm.write(&t1, "A", "1").await.unwrap();
    tm.commit_transaction(&t1).await.unwrap();

    let t2 = tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();
    assert_eq!(tm.read(&t2, "A").await.unwrap(), Some(Bytes::from("1")));
    tm.commit_transaction(&t2).await.unwrap();

    assert!(!tm.lock_manager().holds_lock(&t1, "A", LockType::Shared));
    assert_eq!(tm.metrics().committed, 2);
}

#[tokio::test]
async fn test_abort_restores_every_original_value() {
    let (tm, store) = local_manager();
    store.insert("x", "x0");
    store.insert("y", "y0");

    let tx = tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();
    tm.write(&tx, "x", "x1").await.unwrap();
    tm.write(&tx, "x", "x2").await.unwrap();
    tm.write(&tx, "y", "y1").await.unwrap();
    tm.write(&tx, "z", "z1").await.unwrap();
    assert_eq!(store.get("x"), Some(Bytes::from("x2")));

    tm.abort_transaction(&tx, "test").await.unwrap();

    assert_eq!(store.get("x"), Some(Bytes::from("x0")));
    assert_eq!(store.get("y"), Some(Bytes::from("y0")));
    assert_eq!(store.get("z"), None);
    assert!(tm.lock_manager().get_lock_info().is_empty());
}

#[tokio::test]
async fn test_savepoint_round_trip() {
    let (tm, store) = local_manager();
    let tx = tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();

    tm.write(&tx, "x", "before").await.unwrap();
    tm.create_savepoint(&tx, "s1").await.unwrap();
    tm.write(&tx, "x", "after").await.unwrap();
    tm.write(&tx, "w", "new").await.unwrap();

    tm.rollback_to_savepoint(&tx, "s1").await.unwrap();
    assert_eq!(store.get("x"), Some(Bytes::from("before")));
    assert_eq!(store.get("w"), None);
    assert!(!tm.lock_manager().holds_lock(&tx, "w", LockType::Shared));
    assert!(tm.lock_manager().holds_lock(&tx, "x", LockType::Exclusive));

    // The savepoint is consumed by the rollback
    let err = tm.rollback_to_savepoint(&tx, "s1").await.unwrap_err();
    assert!(matches!(err, Error::SavepointNotFound { .. }));

    // Aborting afterwards still rolls back to the value before the transaction
    tm.abort_transaction(&tx, "done").await.unwrap();
    assert_eq!(store.get("x"), None);
}

#[tokio::test]
async fn test_savepoint_rollback_undoes_lock_upgrade() {
    let (tm, store) = local_manager();
    store.insert("k", "v0");
    let tx = tm
        .begin_transaction(None, opts(IsolationLevel::RepeatableRead))
        .await
        .unwrap();

    assert_eq!(tm.read(&tx, "k").await.unwrap(), Some(Bytes::from("v0")));
    tm.create_savepoint(&tx, "before_write").await.unwrap();
    tm.write(&tx, "k", "v1").await.unwrap();
    assert!(tm.lock_manager().holds_lock(&tx, "k", LockType::Exclusive));

    tm.rollback_to_savepoint(&tx, "before_write").await.unwrap();
    assert_eq!(store.get("k"), Some(Bytes::from("v0")));
    assert!(tm.lock_manager().holds_lock(&tx, "k", LockType::Shared));
    assert!(!tm.lock_manager().holds_lock(&tx, "k", LockType::Exclusive));

    // Back to shared, so another reader gets in without waiting
    let reader = tm
        .begin_transaction(None, opts(IsolationLevel::RepeatableRead))
        .await
        .unwrap();
    assert_eq!(tm.read(&reader, "k").await.unwrap(), Some(Bytes::from("v0")));

    tm.commit_transaction(&reader).await.unwrap();
    tm.commit_transaction(&tx).await.unwrap();
    assert!(tm.lock_manager().get_lock_info().is_empty());
}

#[tokio::test]
async fn test_read_committed_releases_read_lock() {
    let (tm, _store) = local_manager();
    let reader = tm
        .begin_transaction(None, opts(IsolationLevel::ReadCommitted))
        .await
        .unwrap();
    tm.read(&reader, "k").await.unwrap();
    assert!(!tm.lock_manager().holds_lock(&reader, "k", LockType::Shared));

    // A writer does not wait for the reader, so a second read may see a new value
    let writer = tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();
    tm.write(&writer, "k", "v2").await.unwrap();
    tm.commit_transaction(&writer).await.unwrap();
    assert_eq!(tm.read(&reader, "k").await.unwrap(), Some(Bytes::from("v2")));
}

#[tokio::test]
async fn test_repeatable_read_blocks_writer() {
    let (tm, _store) = local_manager();
    let reader = tm
        .begin_transaction(None, opts(IsolationLevel::RepeatableRead))
        .await
        .unwrap();
    tm.read(&reader, "k").await.unwrap();
    assert!(tm.lock_manager().holds_lock(&reader, "k", LockType::Shared));

    let writer = tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();
    let err = tm.write(&writer, "k", "v2").await.unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert_eq!(tm.metrics().lock_timeouts, 1);
}

#[tokio::test]
async fn test_read_uncommitted_sees_uncommitted_write() {
    let (tm, _store) = local_manager();
    let writer = tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();
    tm.write(&writer, "k", "dirty").await.unwrap();

    let reader = tm
        .begin_transaction(None, opts(IsolationLevel::ReadUncommitted))
        .await
        .unwrap();
    assert_eq!(tm.read(&reader, "k").await.unwrap(), Some(Bytes::from("dirty")));
}

#[tokio::test]
async fn test_repeated_abort_is_noop() {
    let (tm, store) = local_manager();
    store.insert("k", "v0");
    let mut events = tm.subscribe();

    let tx = tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();
    tm.write(&tx, "k", "v1").await.unwrap();
    tm.abort_transaction(&tx, "first").await.unwrap();
    tm.abort_transaction(&tx, "second").await.unwrap();

    assert_eq!(store.get("k"), Some(Bytes::from("v0")));
    assert_eq!(tm.metrics().aborted, 1);

    let err = tm.commit_transaction(&tx).await.unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));

    let mut aborted = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TransactionEvent::Aborted { .. }) {
            aborted += 1;
        }
    }
    assert_eq!(aborted, 1);
}

#[tokio::test]
async fn test_inactivity_timeout_aborts_active_transaction() {
    let (tm, store) = local_manager();
    let tx = tm
        .begin_transaction(
            Some(TransactionId::from("slow")),
            TransactionOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    tm.write(&tx, "k", "v").await.unwrap();

    assert!(wait_for_state(&tm, &tx, TransactionState::Aborted, Duration::from_secs(2)).await);
    assert_eq!(store.get("k"), None);
    assert_eq!(tm.metrics().timed_out, 1);

    let err = tm.write(&tx, "k", "again").await.unwrap_err();
    assert!(matches!(err, Error::TransactionTimeout { .. }));
}

#[tokio::test]
async fn test_prepared_branch_survives_timeout() {
    let (tm, _store) = local_manager();
    let tx = tm
        .begin_transaction(
            None,
            TransactionOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    assert!(tm.prepare_transaction(&tx).await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(tm.transaction_state(&tx).await, Some(TransactionState::Prepared));
    tm.commit_local(&tx).await.unwrap();
    assert_eq!(tm.transaction_state(&tx).await, Some(TransactionState::Committed));
}

#[tokio::test]
async fn test_transaction_limit() {
    let (tm, _store) = local_manager_with(TransactionConfig {
        max_concurrent_transactions: 1,
        ..fast_tx_config()
    });
    tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();
    let err = tm
        .begin_transaction(None, TransactionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransactionLimitReached { limit: 1 }));
}

#[tokio::test]
async fn test_shutdown_aborts_active_transactions() {
    let (tm, store) = local_manager();
    let tx = tm.begin_transaction(None, TransactionOptions::default()).await.unwrap();
    tm.write(&tx, "k", "v").await.unwrap();

    tm.shutdown().await.unwrap();
    assert_eq!(tm.transaction_state(&tx).await, Some(TransactionState::Aborted));
    assert_eq!(store.get("k"), None);
    let err = tm
        .begin_transaction(None, TransactionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}
