use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::domain::{Account, AccountId, Cents, Entry, NewEntry, Transfer, TransferRequest};
use crate::storage::{LedgerStore, LedgerTx};

use super::{Cancellation, LedgerError, UnitOfWork};

/// How often and how patiently a conflicting transfer is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(100),
        }
    }
}

/// Everything a committed transfer produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub transfer: Transfer,
    /// `-amount` on the source account
    pub from_entry: Entry,
    /// `+amount` on the destination account
    pub to_entry: Entry,
    pub from_account: Account,
    pub to_account: Account,
}

/// Executes transfers as serializable units of work with ascending-id lock
/// ordering and bounded retry on transient conflicts.
pub struct TransferEngine<S> {
    uow: UnitOfWork<S>,
    policy: RetryPolicy,
}

impl<S> Clone for TransferEngine<S> {
    fn clone(&self) -> Self {
        Self {
            uow: self.uow.clone(),
            policy: self.policy,
        }
    }
}

impl<S: LedgerStore> TransferEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    pub fn with_policy(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            uow: UnitOfWork::new(store),
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Move `request.amount` from one account to another.
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome, LedgerError> {
        self.transfer_with_cancel(request, &Cancellation::never())
            .await
    }

    /// Move money, giving up as soon as `cancel` fires. An attempt in flight
    /// is rolled back and no further attempt starts.
    #[instrument(
        skip_all,
        fields(
            from = request.from_account_id,
            to = request.to_account_id,
            amount = request.amount
        ),
        err
    )]
    pub async fn transfer_with_cancel(
        &self,
        request: TransferRequest,
        cancel: &Cancellation,
    ) -> Result<TransferOutcome, LedgerError> {
        request.validate()?;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }

            let result = self
                .uow
                .run_with_cancel(cancel, move |tx| Box::pin(execute_transfer(tx, request)))
                .await;

            let conflict = match result {
                Ok(outcome) => {
                    info!(transfer_id = outcome.transfer.id, attempt, "transfer committed");
                    return Ok(outcome);
                }
                Err(LedgerError::Store(err)) if err.is_conflict() => err,
                Err(err) => return Err(err),
            };

            if attempt >= max_attempts {
                warn!(attempt, error = %conflict, "transfer conflict, retries exhausted");
                return Err(LedgerError::RetriesExhausted {
                    attempts: attempt,
                    last: conflict,
                });
            }

            warn!(attempt, error = %conflict, "transfer conflict, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LedgerError::Cancelled),
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
        }
    }
}

/// One attempt: transfer row, debit and credit entries, then both balance
/// deltas in ascending account-id order.
async fn execute_transfer<T: LedgerTx>(
    tx: &mut T,
    request: TransferRequest,
) -> Result<TransferOutcome, LedgerError> {
    let TransferRequest {
        from_account_id,
        to_account_id,
        amount,
    } = request;

    let transfer = tx
        .create_transfer(from_account_id, to_account_id, amount)
        .await?;
    let from_entry = tx
        .create_entry(NewEntry::leg(transfer.id, from_account_id, -amount))
        .await?;
    let to_entry = tx
        .create_entry(NewEntry::leg(transfer.id, to_account_id, amount))
        .await?;

    let (from_account, to_account) = apply_in_lock_order(tx, &request).await?;

    Ok(TransferOutcome {
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    })
}

/// Apply both deltas, lowest account id first, and hand the updated rows
/// back in (from, to) order.
async fn apply_in_lock_order<T: LedgerTx>(
    tx: &mut T,
    request: &TransferRequest,
) -> Result<(Account, Account), LedgerError> {
    let [(first_id, first_delta), (second_id, second_delta)]: [(AccountId, Cents); 2] =
        request.balance_deltas();
    debug!(first = first_id, second = second_id, "applying balance deltas");

    let first = tx.apply_balance_delta(first_id, first_delta).await?;
    let second = tx.apply_balance_delta(second_id, second_delta).await?;

    if first.id == request.from_account_id {
        Ok((first, second))
    } else {
        Ok((second, first))
    }
}
