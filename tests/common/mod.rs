// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ledger_tx::application::{RetryPolicy, TransferEngine};
use ledger_tx::domain::{Account, Cents, NewAccount};
use ledger_tx::storage::{LedgerStore, MemoryStore, SqliteOptions, SqliteStore};
use tempfile::TempDir;

/// Helper to create a SQLite store backed by a temporary database
pub async fn sqlite_store() -> Result<(Arc<SqliteStore>, TempDir)> {
    sqlite_store_with(SqliteOptions::default()).await
}

pub async fn sqlite_store_with(options: SqliteOptions) -> Result<(Arc<SqliteStore>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let store = SqliteStore::init(db_path.to_str().unwrap(), &options).await?;
    Ok((Arc::new(store), temp_dir))
}

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// Retry policy with a short delay so retry tests stay fast
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        delay: Duration::from_millis(5),
    }
}

pub fn engine<S: LedgerStore>(store: &Arc<S>) -> TransferEngine<S> {
    TransferEngine::with_policy(Arc::clone(store), fast_policy(5))
}

/// Test fixture: the two accounts most scenarios start from
pub async fn open_pair<S: LedgerStore>(
    store: &S,
    a_balance: Cents,
    b_balance: Cents,
) -> Result<(Account, Account)> {
    let a = store
        .create_account(NewAccount::new("alice", "USD").with_balance(a_balance))
        .await?;
    let b = store
        .create_account(NewAccount::new("bob", "USD").with_balance(b_balance))
        .await?;
    Ok((a, b))
}

/// Number of entries that are transfer legs (excludes opening entries)
pub async fn leg_count<S: LedgerStore>(store: &S) -> Result<usize> {
    Ok(store
        .list_all_entries()
        .await?
        .iter()
        .filter(|e| e.transfer_id.is_some())
        .count())
}

pub async fn balances<S: LedgerStore>(store: &S, a: &Account, b: &Account) -> Result<(Cents, Cents)> {
    Ok((
        store.get_account(a.id).await?.balance,
        store.get_account(b.id).await?.balance,
    ))
}
