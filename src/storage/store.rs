use async_trait::async_trait;

use crate::domain::{
    Account, AccountId, Cents, Entry, EntryId, NewAccount, NewEntry, Transfer, TransferId,
};

use super::StoreResult;

/// The durable system of record for accounts, entries and transfers.
///
/// Operations on the store itself run in their own implicit transaction.
/// Balance deltas and locking reads are only reachable through the
/// transaction handle returned by [`LedgerStore::begin`].
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Tx: LedgerTx;

    /// Open a unit of work.
    async fn begin(&self) -> StoreResult<Self::Tx>;

    // ========================
    // Accounts
    // ========================

    /// Insert an account. A non-zero opening balance also writes an opening entry.
    async fn create_account(&self, account: NewAccount) -> StoreResult<Account>;

    async fn get_account(&self, id: AccountId) -> StoreResult<Account>;

    /// All accounts, ordered by id.
    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;

    /// Administrative override of a balance. Writes no entry.
    async fn set_account_balance(&self, id: AccountId, balance: Cents) -> StoreResult<Account>;

    /// Fails with `ConstraintViolation` while entries or transfers reference the account.
    async fn delete_account(&self, id: AccountId) -> StoreResult<()>;

    // ========================
    // Entries
    // ========================

    async fn get_entry(&self, id: EntryId) -> StoreResult<Entry>;

    /// Entries of one account, ordered by id.
    async fn list_entries(&self, account_id: AccountId) -> StoreResult<Vec<Entry>>;

    /// Every entry in the ledger, ordered by id.
    async fn list_all_entries(&self) -> StoreResult<Vec<Entry>>;

    /// The legs linked to a transfer, ordered by id.
    async fn entries_for_transfer(&self, transfer_id: TransferId) -> StoreResult<Vec<Entry>>;

    async fn delete_entry(&self, id: EntryId) -> StoreResult<()>;

    // ========================
    // Transfers
    // ========================

    async fn get_transfer(&self, id: TransferId) -> StoreResult<Transfer>;

    /// All transfers, ordered by id.
    async fn list_transfers(&self) -> StoreResult<Vec<Transfer>>;

    /// Deletes the transfer row; its entries survive with the link cleared.
    async fn delete_transfer(&self, id: TransferId) -> StoreResult<()>;
}

/// A transaction-scoped handle to the store.
///
/// Nothing written through a handle is visible to other units of work until
/// [`LedgerTx::commit`]. Dropping a handle without committing rolls it back.
#[async_trait]
pub trait LedgerTx: Send {
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
    ) -> StoreResult<Transfer>;

    async fn create_entry(&mut self, entry: NewEntry) -> StoreResult<Entry>;

    /// Add `delta` to the account's balance under an exclusive row lock held
    /// until the unit of work ends, returning the updated row.
    async fn apply_balance_delta(&mut self, account_id: AccountId, delta: Cents)
    -> StoreResult<Account>;

    /// Read the latest account row while taking the same exclusive lock.
    async fn read_account_for_update(&mut self, account_id: AccountId) -> StoreResult<Account>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}
