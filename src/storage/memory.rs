use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use crate::domain::{
    Account, AccountId, Cents, Entry, EntryId, NewAccount, NewEntry, Transfer, TransferId,
};

use super::{LedgerStore, LedgerTx, StoreError, StoreResult};

/// Store operations that can have faults injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Begin,
    CreateTransfer,
    CreateEntry,
    ApplyBalanceDelta,
    ReadAccountForUpdate,
    Commit,
    Rollback,
}

type ErrorFactory = Box<dyn Fn() -> StoreError + Send + Sync>;

struct Fault {
    operation: Operation,
    remaining: usize,
    make_error: ErrorFactory,
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
    last_account_id: AccountId,
    last_entry_id: EntryId,
    last_transfer_id: TransferId,
}

impl Tables {
    fn next_account_id(&mut self) -> AccountId {
        self.last_account_id += 1;
        self.last_account_id
    }

    fn next_entry_id(&mut self) -> EntryId {
        self.last_entry_id += 1;
        self.last_entry_id
    }

    fn next_transfer_id(&mut self) -> TransferId {
        self.last_transfer_id += 1;
        self.last_transfer_id
    }

    fn account(&self, id: AccountId) -> StoreResult<&Account> {
        self.accounts
            .get(&id)
            .ok_or_else(|| StoreError::not_found("account", id))
    }

    fn is_referenced(&self, id: AccountId) -> bool {
        self.entries.values().any(|e| e.account_id == id)
            || self
                .transfers
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id)
    }
}

struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<AccountId, Arc<RowLock<()>>>>,
    faults: Mutex<Vec<Fault>>,
    lock_timeout: Duration,
    begun: AtomicUsize,
}

impl Shared {
    fn row_lock(&self, id: AccountId) -> Arc<RowLock<()>> {
        self.row_locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .clone()
    }

    /// Wait for an account's row lock, reporting a conflict on timeout the
    /// way an engine's deadlock detector aborts one of the waiters.
    async fn acquire_row(&self, id: AccountId) -> StoreResult<OwnedMutexGuard<()>> {
        let lock = self.row_lock(id);
        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                StoreError::Conflict(format!(
                    "lock wait on account {} exceeded {:?}",
                    id, self.lock_timeout
                ))
            })
    }

    fn take_fault(&self, operation: Operation) -> Option<StoreError> {
        let mut faults = self.faults.lock();
        let index = faults
            .iter()
            .position(|f| f.operation == operation && f.remaining > 0)?;
        let fault = &mut faults[index];
        fault.remaining -= 1;
        let err = (fault.make_error)();
        if fault.remaining == 0 {
            faults.remove(index);
        }
        Some(err)
    }

    fn check_fault(&self, operation: Operation) -> StoreResult<()> {
        match self.take_fault(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-process store with per-account row locks and staged, isolated
/// transactions. Used as the test double for the engine.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(2))
    }

    /// A store whose row-lock waits give up with `Conflict` after `lock_timeout`.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                faults: Mutex::new(Vec::new()),
                lock_timeout,
                begun: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `times` calls of `operation` fail with the error built by `make_error`.
    pub fn inject_fault(
        &self,
        operation: Operation,
        times: usize,
        make_error: impl Fn() -> StoreError + Send + Sync + 'static,
    ) {
        if times == 0 {
            return;
        }
        self.shared.faults.lock().push(Fault {
            operation,
            remaining: times,
            make_error: Box::new(make_error),
        });
    }

    /// Number of units of work opened so far (including failed begins).
    pub fn begun(&self) -> usize {
        self.shared.begun.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StoreResult<MemoryTx> {
        self.shared.begun.fetch_add(1, Ordering::SeqCst);
        self.shared.check_fault(Operation::Begin)?;
        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            locks: HashMap::new(),
            deltas: BTreeMap::new(),
            transfers: Vec::new(),
            entries: Vec::new(),
        })
    }

    // ========================
    // Accounts
    // ========================

    async fn create_account(&self, account: NewAccount) -> StoreResult<Account> {
        let mut tables = self.shared.tables.lock();
        let now = Utc::now();

        let created = Account {
            id: tables.next_account_id(),
            owner: account.owner,
            currency: account.currency,
            balance: account.balance,
            created_at: now,
        };
        tables.accounts.insert(created.id, created.clone());

        if created.balance != 0 {
            let opening = NewEntry::opening(created.id, created.balance);
            let id = tables.next_entry_id();
            tables.entries.insert(
                id,
                Entry {
                    id,
                    account_id: opening.account_id,
                    transfer_id: None,
                    amount: opening.amount,
                    created_at: now,
                },
            );
        }

        Ok(created)
    }

    async fn get_account(&self, id: AccountId) -> StoreResult<Account> {
        self.shared.tables.lock().account(id).cloned()
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        Ok(self.shared.tables.lock().accounts.values().cloned().collect())
    }

    async fn set_account_balance(&self, id: AccountId, balance: Cents) -> StoreResult<Account> {
        self.shared.tables.lock().account(id)?;
        let _row = self.shared.acquire_row(id).await?;

        let mut tables = self.shared.tables.lock();
        let account = tables
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("account", id))?;
        account.balance = balance;
        Ok(account.clone())
    }

    async fn delete_account(&self, id: AccountId) -> StoreResult<()> {
        self.shared.tables.lock().account(id)?;
        let _row = self.shared.acquire_row(id).await?;

        let mut tables = self.shared.tables.lock();
        tables.account(id)?;
        if tables.is_referenced(id) {
            return Err(StoreError::ConstraintViolation(format!(
                "account {} is still referenced by entries or transfers",
                id
            )));
        }
        tables.accounts.remove(&id);
        self.shared.row_locks.lock().remove(&id);
        Ok(())
    }

    // ========================
    // Entries
    // ========================

    async fn get_entry(&self, id: EntryId) -> StoreResult<Entry> {
        self.shared
            .tables
            .lock()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("entry", id))
    }

    async fn list_entries(&self, account_id: AccountId) -> StoreResult<Vec<Entry>> {
        Ok(self
            .shared
            .tables
            .lock()
            .entries
            .values()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn list_all_entries(&self) -> StoreResult<Vec<Entry>> {
        Ok(self.shared.tables.lock().entries.values().cloned().collect())
    }

    async fn entries_for_transfer(&self, transfer_id: TransferId) -> StoreResult<Vec<Entry>> {
        Ok(self
            .shared
            .tables
            .lock()
            .entries
            .values()
            .filter(|e| e.transfer_id == Some(transfer_id))
            .cloned()
            .collect())
    }

    async fn delete_entry(&self, id: EntryId) -> StoreResult<()> {
        self.shared
            .tables
            .lock()
            .entries
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("entry", id))
    }

    // ========================
    // Transfers
    // ========================

    async fn get_transfer(&self, id: TransferId) -> StoreResult<Transfer> {
        self.shared
            .tables
            .lock()
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("transfer", id))
    }

    async fn list_transfers(&self) -> StoreResult<Vec<Transfer>> {
        Ok(self.shared.tables.lock().transfers.values().cloned().collect())
    }

    async fn delete_transfer(&self, id: TransferId) -> StoreResult<()> {
        let mut tables = self.shared.tables.lock();
        if tables.transfers.remove(&id).is_none() {
            return Err(StoreError::not_found("transfer", id));
        }
        for entry in tables.entries.values_mut() {
            if entry.transfer_id == Some(id) {
                entry.transfer_id = None;
            }
        }
        Ok(())
    }
}

/// A unit of work on [`MemoryStore`].
///
/// Inserts and deltas are staged locally and published atomically on commit.
/// Row locks taken by balance operations are released when the handle is
/// committed, rolled back or dropped.
pub struct MemoryTx {
    shared: Arc<Shared>,
    locks: HashMap<AccountId, OwnedMutexGuard<()>>,
    deltas: BTreeMap<AccountId, Cents>,
    transfers: Vec<Transfer>,
    entries: Vec<Entry>,
}

impl MemoryTx {
    async fn lock_row(&mut self, id: AccountId) -> StoreResult<()> {
        if self.locks.contains_key(&id) {
            return Ok(());
        }
        // Fail fast on unknown accounts instead of queueing on their lock
        self.shared.tables.lock().account(id)?;
        let guard = self.shared.acquire_row(id).await?;
        self.locks.insert(id, guard);
        Ok(())
    }

    /// The account as this unit of work sees it: committed row plus staged delta.
    fn staged_account(&self, id: AccountId) -> StoreResult<Account> {
        let tables = self.shared.tables.lock();
        let mut account = tables.account(id)?.clone();
        let delta = self.deltas.get(&id).copied().unwrap_or(0);
        account.balance = account
            .balance
            .checked_add(delta)
            .ok_or_else(|| overflow(id))?;
        Ok(account)
    }
}

fn overflow(id: AccountId) -> StoreError {
    StoreError::ConstraintViolation(format!("balance of account {} would overflow", id))
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
    ) -> StoreResult<Transfer> {
        self.shared.check_fault(Operation::CreateTransfer)?;
        if amount <= 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "transfer amount must be positive, got {}",
                amount
            )));
        }
        if from_account_id == to_account_id {
            return Err(StoreError::ConstraintViolation(format!(
                "transfer endpoints must differ, both are {}",
                from_account_id
            )));
        }

        let mut tables = self.shared.tables.lock();
        tables.account(from_account_id)?;
        tables.account(to_account_id)?;

        let transfer = Transfer {
            id: tables.next_transfer_id(),
            from_account_id,
            to_account_id,
            amount,
            created_at: Utc::now(),
        };
        drop(tables);

        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn create_entry(&mut self, entry: NewEntry) -> StoreResult<Entry> {
        self.shared.check_fault(Operation::CreateEntry)?;

        let mut tables = self.shared.tables.lock();
        tables.account(entry.account_id)?;
        if let Some(transfer_id) = entry.transfer_id {
            let known = tables.transfers.contains_key(&transfer_id)
                || self.transfers.iter().any(|t| t.id == transfer_id);
            if !known {
                return Err(StoreError::ConstraintViolation(format!(
                    "entry references unknown transfer {}",
                    transfer_id
                )));
            }
        }

        let created = Entry {
            id: tables.next_entry_id(),
            account_id: entry.account_id,
            transfer_id: entry.transfer_id,
            amount: entry.amount,
            created_at: Utc::now(),
        };
        drop(tables);

        self.entries.push(created.clone());
        Ok(created)
    }

    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: Cents,
    ) -> StoreResult<Account> {
        self.shared.check_fault(Operation::ApplyBalanceDelta)?;
        self.lock_row(account_id).await?;

        let mut account = self.staged_account(account_id)?;
        account.balance = account
            .balance
            .checked_add(delta)
            .ok_or_else(|| overflow(account_id))?;
        *self.deltas.entry(account_id).or_insert(0) += delta;
        Ok(account)
    }

    async fn read_account_for_update(&mut self, account_id: AccountId) -> StoreResult<Account> {
        self.shared.check_fault(Operation::ReadAccountForUpdate)?;
        self.lock_row(account_id).await?;
        self.staged_account(account_id)
    }

    async fn commit(self) -> StoreResult<()> {
        self.shared.check_fault(Operation::Commit)?;

        let mut tables = self.shared.tables.lock();

        // Validate everything before publishing anything
        for transfer in &self.transfers {
            for id in [transfer.from_account_id, transfer.to_account_id] {
                if !tables.accounts.contains_key(&id) {
                    return Err(StoreError::ConstraintViolation(format!(
                        "transfer {} references deleted account {}",
                        transfer.id, id
                    )));
                }
            }
        }
        for entry in &self.entries {
            if !tables.accounts.contains_key(&entry.account_id) {
                return Err(StoreError::ConstraintViolation(format!(
                    "entry {} references deleted account {}",
                    entry.id, entry.account_id
                )));
            }
        }
        let mut balances = Vec::with_capacity(self.deltas.len());
        for (&id, &delta) in &self.deltas {
            let account = tables.accounts.get(&id).ok_or_else(|| {
                StoreError::ConstraintViolation(format!("account {} was deleted", id))
            })?;
            let balance = account.balance.checked_add(delta).ok_or_else(|| overflow(id))?;
            balances.push((id, balance));
        }

        for (id, balance) in balances {
            if let Some(account) = tables.accounts.get_mut(&id) {
                account.balance = balance;
            }
        }
        for transfer in &self.transfers {
            tables.transfers.insert(transfer.id, transfer.clone());
        }
        for entry in &self.entries {
            tables.entries.insert(entry.id, entry.clone());
        }

        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        // Staged writes and row locks are released when `self` drops
        self.shared.check_fault(Operation::Rollback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_accounts() -> (MemoryStore, Account, Account) {
        let store = MemoryStore::new();
        let a = store
            .create_account(NewAccount::new("alice", "USD").with_balance(1000))
            .await
            .unwrap();
        let b = store
            .create_account(NewAccount::new("bob", "USD").with_balance(500))
            .await
            .unwrap();
        (store, a, b)
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let (store, a, b) = store_with_accounts().await;

        let mut tx = store.begin().await.unwrap();
        let transfer = tx.create_transfer(a.id, b.id, 100).await.unwrap();
        tx.create_entry(NewEntry::leg(transfer.id, a.id, -100))
            .await
            .unwrap();
        let updated = tx.apply_balance_delta(a.id, -100).await.unwrap();
        assert_eq!(updated.balance, 900);

        assert_eq!(store.get_account(a.id).await.unwrap().balance, 1000);
        assert!(store.get_transfer(transfer.id).await.is_err());

        tx.commit().await.unwrap();

        assert_eq!(store.get_account(a.id).await.unwrap().balance, 900);
        assert_eq!(store.entries_for_transfer(transfer.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_tx_discards_writes_and_releases_locks() {
        let (store, a, _) = store_with_accounts().await;

        {
            let mut tx = store.begin().await.unwrap();
            tx.apply_balance_delta(a.id, 250).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        let account = tx.read_account_for_update(a.id).await.unwrap();
        assert_eq!(account.balance, 1000);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_wait_timeout_reports_conflict() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(20));
        let a = store.create_account(NewAccount::new("a", "USD")).await.unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.read_account_for_update(a.id).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.apply_balance_delta(a.id, 1).await.unwrap_err();
        assert!(err.is_conflict(), "expected conflict, got {err:?}");
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_found() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.apply_balance_delta(99, 5).await.unwrap_err(),
            StoreError::not_found("account", 99)
        );
    }

    #[tokio::test]
    async fn test_delete_account_drops_its_row_lock() {
        let (store, a, b) = store_with_accounts().await;
        let idle = store.create_account(NewAccount::new("idle", "USD")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.read_account_for_update(idle.id).await.unwrap();
        tx.read_account_for_update(a.id).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.shared.row_locks.lock().len(), 2);

        store.delete_account(idle.id).await.unwrap();

        let locks = store.shared.row_locks.lock();
        assert!(!locks.contains_key(&idle.id));
        assert!(locks.contains_key(&a.id));
        assert!(!locks.contains_key(&b.id));
    }

    #[tokio::test]
    async fn test_injected_faults_fire_requested_times() {
        let store = MemoryStore::new();
        store.inject_fault(Operation::Begin, 2, || StoreError::Unavailable("down".into()));

        assert!(store.begin().await.is_err());
        assert!(store.begin().await.is_err());
        assert!(store.begin().await.is_ok());
        assert_eq!(store.begun(), 3);
    }

    #[tokio::test]
    async fn test_delta_overflow_is_constraint_violation() {
        let store = MemoryStore::new();
        let a = store
            .create_account(NewAccount::new("a", "USD").with_balance(i64::MAX))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.apply_balance_delta(a.id, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }
}
