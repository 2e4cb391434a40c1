mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{
    balances, fast_policy, leg_count, memory_store, open_pair, sqlite_store, sqlite_store_with,
};
use ledger_tx::application::{
    Cancellation, LedgerError, RetryPolicy, TransferEngine, UnitOfWork, check_integrity,
};
use ledger_tx::domain::{NewAccount, NewEntry, TransferRequest};
use ledger_tx::storage::{
    ErrorKind, LedgerStore, LedgerTx, MemoryStore, Operation, SqliteOptions, StoreError,
};

fn conflict() -> StoreError {
    StoreError::Conflict("serialization failure".into())
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("connection reset".into())
}

#[tokio::test]
async fn test_transient_conflicts_are_retried() -> Result<()> {
    let store = memory_store();
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(5));

    store.inject_fault(Operation::ApplyBalanceDelta, 3, conflict);
    let outcome = engine.transfer(TransferRequest::new(a.id, b.id, 100)).await?;

    assert_eq!(store.begun(), 4);
    assert_eq!(outcome.from_account.balance, 900);
    assert_eq!(outcome.to_account.balance, 600);

    // Failed attempts leave nothing behind
    assert_eq!(store.list_transfers().await?.len(), 1);
    assert_eq!(leg_count(store.as_ref()).await?, 2);
    assert_eq!(balances(store.as_ref(), &a, &b).await?, (900, 600));
    Ok(())
}

#[tokio::test]
async fn test_persistent_conflict_exhausts_retries() -> Result<()> {
    let store = memory_store();
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(5));

    store.inject_fault(Operation::CreateTransfer, 5, conflict);
    let err = engine
        .transfer(TransferRequest::new(a.id, b.id, 100))
        .await
        .unwrap_err();

    match &err {
        LedgerError::RetriesExhausted { attempts, last } => {
            assert_eq!(*attempts, 5);
            assert!(last.is_conflict());
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(store.begun(), 5);
    assert!(store.list_transfers().await?.is_empty());
    assert_eq!(balances(store.as_ref(), &a, &b).await?, (1000, 500));
    Ok(())
}

#[tokio::test]
async fn test_default_policy_makes_five_attempts() -> Result<()> {
    let store = memory_store();
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::new(Arc::clone(&store));
    assert_eq!(engine.policy(), RetryPolicy::default());

    store.inject_fault(Operation::ApplyBalanceDelta, 10, conflict);
    let started = tokio::time::Instant::now();
    let err = engine
        .transfer(TransferRequest::new(a.id, b.id, 1))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::RetriesExhausted { attempts: 5, .. }));
    assert_eq!(store.begun(), 5);
    // Four pauses of 100ms between five attempts
    assert!(started.elapsed() >= Duration::from_millis(400));
    Ok(())
}

#[tokio::test]
async fn test_non_retryable_failure_is_atomic() -> Result<()> {
    let store = memory_store();
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(5));

    // The transfer row is already staged when the first leg fails
    store.inject_fault(Operation::CreateEntry, 1, || StoreError::Unavailable("disk full".into()));
    let err = engine
        .transfer(TransferRequest::new(a.id, b.id, 100))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(store.begun(), 1, "non-retryable errors are not retried");
    assert!(store.list_transfers().await?.is_empty());
    assert_eq!(leg_count(store.as_ref()).await?, 0);
    assert_eq!(balances(store.as_ref(), &a, &b).await?, (1000, 500));
    assert!(check_integrity(store.as_ref()).await?.is_healthy());
    Ok(())
}

async fn failure_after_first_delta_is_atomic<S: LedgerStore>(store: Arc<S>) -> Result<()> {
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(1));

    let outcome = engine.transfer(TransferRequest::new(a.id, b.id, 10)).await?;
    assert_eq!(outcome.from_account.balance, 990);

    // The transfer row, both legs and the debit are written before the
    // credit overflows
    let rich = store
        .create_account(NewAccount::new("rich", "USD").with_balance(i64::MAX))
        .await?;
    assert!(a.id < rich.id);
    let err = engine
        .transfer(TransferRequest::new(a.id, rich.id, 1))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConstraintViolation, "{err}");
    assert_eq!(store.get_account(a.id).await?.balance, 990);
    assert_eq!(store.get_account(rich.id).await?.balance, i64::MAX);
    assert_eq!(store.list_transfers().await?.len(), 1);
    assert_eq!(leg_count(store.as_ref()).await?, 2);
    assert!(store.list_entries(rich.id).await?.iter().all(|e| e.transfer_id.is_none()));
    assert!(check_integrity(store.as_ref()).await?.is_healthy());
    Ok(())
}

#[tokio::test]
async fn test_failure_after_first_delta_is_atomic_memory() -> Result<()> {
    failure_after_first_delta_is_atomic(memory_store()).await
}

#[tokio::test]
async fn test_failure_after_first_delta_is_atomic_sqlite() -> Result<()> {
    let (store, _temp) = sqlite_store().await?;
    failure_after_first_delta_is_atomic(store).await
}

#[tokio::test]
async fn test_rollback_failure_reports_both_errors() -> Result<()> {
    let store = memory_store();
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(5));

    store.inject_fault(Operation::ApplyBalanceDelta, 1, conflict);
    store.inject_fault(Operation::Rollback, 1, unavailable);
    let err = engine
        .transfer(TransferRequest::new(a.id, b.id, 100))
        .await
        .unwrap_err();

    match &err {
        LedgerError::RollbackFailed { cause, rollback } => {
            assert!(matches!(cause.as_ref(), LedgerError::Store(StoreError::Conflict(_))));
            assert_eq!(*rollback, unavailable());
        }
        other => panic!("expected RollbackFailed, got {other:?}"),
    }
    assert!(!err.is_retryable());
    let message = err.to_string();
    assert!(message.contains("serialization failure"), "{message}");
    assert!(message.contains("connection reset"), "{message}");

    // A conflict whose rollback failed is not retried
    assert_eq!(store.begun(), 1);
    assert!(store.list_transfers().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_commit_failure_is_not_retried() -> Result<()> {
    let store = memory_store();
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(5));

    store.inject_fault(Operation::Commit, 1, unavailable);
    let err = engine
        .transfer(TransferRequest::new(a.id, b.id, 100))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(store.begun(), 1);
    assert!(store.list_transfers().await?.is_empty());
    assert_eq!(balances(store.as_ref(), &a, &b).await?, (1000, 500));
    Ok(())
}

#[tokio::test]
async fn test_begin_failure_surfaces_unchanged() -> Result<()> {
    let store = memory_store();
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(5));

    store.inject_fault(Operation::Begin, 1, unavailable);
    let err = engine
        .transfer(TransferRequest::new(a.id, b.id, 100))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Store(StoreError::Unavailable(_))));
    assert_eq!(store.begun(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_before_start() -> Result<()> {
    let store = memory_store();
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(5));

    let (handle, cancel) = Cancellation::new();
    handle.cancel();
    let err = engine
        .transfer_with_cancel(TransferRequest::new(a.id, b.id, 100), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Cancelled));
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(store.begun(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_while_waiting_for_row_lock() -> Result<()> {
    let store = Arc::new(MemoryStore::with_lock_timeout(Duration::from_secs(30)));
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(5));

    // Another unit of work holds the lower-id row, which the transfer locks first
    let mut holder = store.begin().await?;
    holder.read_account_for_update(a.id).await?;

    let (handle, cancel) = Cancellation::new();
    let task = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .transfer_with_cancel(TransferRequest::new(b.id, a.id, 100), &cancel)
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    handle.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancellation should interrupt the lock wait")?
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));
    assert_eq!(store.begun(), 2);

    holder.rollback().await?;

    // The abandoned attempt released its locks and wrote nothing
    let mut probe = store.begin().await?;
    probe.read_account_for_update(a.id).await?;
    probe.read_account_for_update(b.id).await?;
    probe.rollback().await?;

    assert!(store.list_transfers().await?.is_empty());
    assert_eq!(leg_count(store.as_ref()).await?, 0);
    assert_eq!(balances(store.as_ref(), &a, &b).await?, (1000, 500));
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_retry_delay() -> Result<()> {
    let store = memory_store();
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let policy = RetryPolicy {
        max_attempts: 5,
        delay: Duration::from_secs(30),
    };
    let engine = TransferEngine::with_policy(Arc::clone(&store), policy);

    store.inject_fault(Operation::ApplyBalanceDelta, 1, conflict);
    let (handle, cancel) = Cancellation::new();
    let task = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .transfer_with_cancel(TransferRequest::new(a.id, b.id, 100), &cancel)
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.begun(), 1);
    handle.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancellation should cut the retry delay short")?
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));
    assert_eq!(store.begun(), 1, "no attempt starts after cancellation");
    assert!(store.list_transfers().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unit_of_work_commits_or_discards() -> Result<()> {
    let store = memory_store();
    let (a, _) = open_pair(store.as_ref(), 1000, 500).await?;
    let uow = UnitOfWork::new(Arc::clone(&store));
    let id = a.id;

    let balance = uow
        .run(move |tx| {
            Box::pin(async move {
                tx.create_entry(NewEntry::opening(id, 50)).await?;
                let account = tx.apply_balance_delta(id, 50).await?;
                Ok::<_, LedgerError>(account.balance)
            })
        })
        .await?;
    assert_eq!(balance, 1050);
    assert_eq!(store.get_account(id).await?.balance, 1050);

    let err = uow
        .run(move |tx| {
            Box::pin(async move {
                tx.apply_balance_delta(id, -2000).await?;
                Err::<(), _>(LedgerError::Store(StoreError::ConstraintViolation(
                    "insufficient funds".into(),
                )))
            })
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(store.get_account(id).await?.balance, 1050);
    assert!(check_integrity(store.as_ref()).await?.is_healthy());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sqlite_lock_contention_is_retried_as_conflict() -> Result<()> {
    let options = SqliteOptions {
        busy_timeout: Duration::from_millis(10),
        ..SqliteOptions::default()
    };
    let (store, _temp) = sqlite_store_with(options).await?;
    let (a, b) = open_pair(store.as_ref(), 1000, 500).await?;
    let engine = TransferEngine::with_policy(Arc::clone(&store), fast_policy(3));

    // Hold the database write lock from another unit of work
    let mut holder = store.begin().await?;
    holder.read_account_for_update(a.id).await?;

    let err = engine
        .transfer(TransferRequest::new(a.id, b.id, 100))
        .await
        .unwrap_err();
    match &err {
        LedgerError::RetriesExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(last.is_conflict(), "{last}");
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }

    holder.rollback().await?;

    let outcome = engine.transfer(TransferRequest::new(a.id, b.id, 100)).await?;
    assert_eq!(outcome.from_account.balance, 900);
    assert_eq!(store.list_transfers().await?.len(), 1);
    assert_eq!(leg_count(store.as_ref()).await?, 2);
    Ok(())
}
