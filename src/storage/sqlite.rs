use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use crate::domain::{
    Account, AccountId, Cents, Entry, EntryId, NewAccount, NewEntry, Transfer, TransferId,
};

use super::{LedgerStore, LedgerTx, MIGRATION_001_INITIAL, StoreError, StoreResult};

const ACCOUNT_COLUMNS: &str = "id, owner, currency, balance, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, transfer_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

/// Primary SQLite result codes that signal lock contention. Extended codes
/// (e.g. `SQLITE_BUSY_SNAPSHOT`) carry the primary code in their low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Connection settings for the SQLite store.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub max_connections: u32,
    /// How long a connection waits on the database write lock before
    /// SQLite reports `SQLITE_BUSY`
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// True when SQLite reports transient lock contention (busy or locked).
///
/// This is the only place that knows which engine codes are retryable.
pub fn is_conflict(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::ForeignKeyViolation)
    )
}

/// Translate a driver error into the store taxonomy.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    if is_conflict(&err) {
        return StoreError::Conflict(format!("{operation}: {err}"));
    }
    match &err {
        sqlx::Error::Database(db) => match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation
            | sqlx::error::ErrorKind::ForeignKeyViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::CheckViolation => {
                StoreError::ConstraintViolation(format!("{operation}: {err}"))
            }
            _ => StoreError::Unavailable(format!("{operation}: {err}")),
        },
        _ => StoreError::Unavailable(format!("{operation}: {err}")),
    }
}

fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("invalid timestamp {value:?}: {e}")))
}

fn row_to_account(row: &SqliteRow) -> StoreResult<Account> {
    let created_at: String = row.get("created_at");
    Ok(Account {
        id: row.get("id"),
        owner: row.get("owner"),
        currency: row.get("currency"),
        balance: row.get("balance"),
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_entry(row: &SqliteRow) -> StoreResult<Entry> {
    let created_at: String = row.get("created_at");
    Ok(Entry {
        id: row.get("id"),
        account_id: row.get("account_id"),
        transfer_id: row.get("transfer_id"),
        amount: row.get("amount"),
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_transfer(row: &SqliteRow) -> StoreResult<Transfer> {
    let created_at: String = row.get("created_at");
    Ok(Transfer {
        id: row.get("id"),
        from_account_id: row.get("from_account_id"),
        to_account_id: row.get("to_account_id"),
        amount: row.get("amount"),
        created_at: parse_timestamp(&created_at)?,
    })
}

/// First id in `ids` with no account row, if any.
async fn find_missing_account(
    conn: &mut SqliteConnection,
    ids: &[AccountId],
) -> StoreResult<Option<AccountId>> {
    for &id in ids {
        let row = sqlx::query("SELECT 1 FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("check account", e))?;
        if row.is_none() {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

async fn insert_entry(conn: &mut SqliteConnection, entry: NewEntry) -> StoreResult<Entry> {
    let result = sqlx::query(&format!(
        "INSERT INTO entries (account_id, transfer_id, amount, created_at) VALUES (?, ?, ?, ?) RETURNING {ENTRY_COLUMNS}"
    ))
    .bind(entry.account_id)
    .bind(entry.transfer_id)
    .bind(entry.amount)
    .bind(Utc::now().to_rfc3339())
    .fetch_one(&mut *conn)
    .await;

    match result {
        Ok(row) => row_to_entry(&row),
        Err(err) if is_foreign_key_violation(&err) => {
            match find_missing_account(conn, &[entry.account_id]).await? {
                Some(id) => Err(StoreError::not_found("account", id)),
                None => Err(map_sqlx_error("create entry", err)),
            }
        }
        Err(err) => Err(map_sqlx_error("create entry", err)),
    }
}

/// Engine-backed store on a pooled SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn open(path: &str, options: &SqliteOptions, create: bool) -> StoreResult<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to open database {path}: {e}")))?;

        debug!(path, max_connections = options.max_connections, "opened sqlite pool");
        Ok(Self::new(pool))
    }

    /// Connect to an existing database file.
    pub async fn connect(path: &str, options: &SqliteOptions) -> StoreResult<Self> {
        Self::open(path, options, false).await
    }

    /// Create the database file if needed and run migrations.
    pub async fn init(path: &str, options: &SqliteOptions) -> StoreResult<Self> {
        let store = Self::open(path, options, true).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("run migration 001", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    type Tx = SqliteTx;

    async fn begin(&self) -> StoreResult<SqliteTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin transaction", e))?;
        Ok(SqliteTx { tx })
    }

    // ========================
    // Accounts
    // ========================

    async fn create_account(&self, account: NewAccount) -> StoreResult<Account> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO accounts (owner, currency, balance, created_at) VALUES (?, ?, ?, ?) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&account.owner)
        .bind(&account.currency)
        .bind(account.balance)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&mut *tx.tx)
        .await
        .map_err(|e| map_sqlx_error("create account", e))?;
        let created = row_to_account(&row)?;

        if created.balance != 0 {
            insert_entry(&mut tx.tx, NewEntry::opening(created.id, created.balance)).await?;
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_account(&self, id: AccountId) -> StoreResult<Account> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get account", e))?;

        match row {
            Some(row) => row_to_account(&row),
            None => Err(StoreError::not_found("account", id)),
        }
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list accounts", e))?;

        rows.iter().map(row_to_account).collect()
    }

    async fn set_account_balance(&self, id: AccountId, balance: Cents) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = ? WHERE id = ? RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(balance)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set account balance", e))?;

        match row {
            Some(row) => row_to_account(&row),
            None => Err(StoreError::not_found("account", id)),
        }
    }

    async fn delete_account(&self, id: AccountId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete account", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("account", id));
        }
        Ok(())
    }

    // ========================
    // Entries
    // ========================

    async fn get_entry(&self, id: EntryId) -> StoreResult<Entry> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get entry", e))?;

        match row {
            Some(row) => row_to_entry(&row),
            None => Err(StoreError::not_found("entry", id)),
        }
    }

    async fn list_entries(&self, account_id: AccountId) -> StoreResult<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = ? ORDER BY id"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list entries", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn list_all_entries(&self) -> StoreResult<Vec<Entry>> {
        let rows = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM entries ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list all entries", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn entries_for_transfer(&self, transfer_id: TransferId) -> StoreResult<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE transfer_id = ? ORDER BY id"
        ))
        .bind(transfer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list transfer entries", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn delete_entry(&self, id: EntryId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM entries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete entry", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("entry", id));
        }
        Ok(())
    }

    // ========================
    // Transfers
    // ========================

    async fn get_transfer(&self, id: TransferId) -> StoreResult<Transfer> {
        let row = sqlx::query(&format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get transfer", e))?;

        match row {
            Some(row) => row_to_transfer(&row),
            None => Err(StoreError::not_found("transfer", id)),
        }
    }

    async fn list_transfers(&self) -> StoreResult<Vec<Transfer>> {
        let rows = sqlx::query(&format!("SELECT {TRANSFER_COLUMNS} FROM transfers ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list transfers", e))?;

        rows.iter().map(row_to_transfer).collect()
    }

    async fn delete_transfer(&self, id: TransferId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM transfers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete transfer", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("transfer", id));
        }
        Ok(())
    }
}

/// A unit of work on the SQLite store.
///
/// SQLite locks the whole database for writing rather than single rows, so
/// the first write statement of a unit of work serializes it against every
/// other writer until commit. The ascending-id order of balance updates is
/// still honoured so the same code path is deadlock-free on row-locking engines.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl LedgerTx for SqliteTx {
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
    ) -> StoreResult<Transfer> {
        let result = sqlx::query(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at) VALUES (?, ?, ?, ?) RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(from_account_id)
        .bind(to_account_id)
        .bind(amount)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&mut *self.tx)
        .await;

        match result {
            Ok(row) => row_to_transfer(&row),
            Err(err) if is_foreign_key_violation(&err) => {
                match find_missing_account(&mut self.tx, &[from_account_id, to_account_id]).await? {
                    Some(id) => Err(StoreError::not_found("account", id)),
                    None => Err(map_sqlx_error("create transfer", err)),
                }
            }
            Err(err) => Err(map_sqlx_error("create transfer", err)),
        }
    }

    async fn create_entry(&mut self, entry: NewEntry) -> StoreResult<Entry> {
        insert_entry(&mut self.tx, entry).await
    }

    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: Cents,
    ) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = balance + ? WHERE id = ? RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(delta)
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("apply balance delta", e))?;

        match row {
            Some(row) => row_to_account(&row),
            None => Err(StoreError::not_found("account", account_id)),
        }
    }

    async fn read_account_for_update(&mut self, account_id: AccountId) -> StoreResult<Account> {
        // A self-assignment takes the write lock the way SELECT ... FOR UPDATE would.
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = balance WHERE id = ? RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("read account for update", e))?;

        match row {
            Some(row) => row_to_account(&row),
            None => Err(StoreError::not_found("account", account_id)),
        }
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::Unavailable(format!("commit failed: {e}")))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StoreError::Unavailable(format!("rollback failed: {e}")))
    }
}
