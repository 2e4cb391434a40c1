use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, instrument};

use crate::storage::{LedgerStore, LedgerTx};

use super::{Cancellation, LedgerError};

/// Runs a sequence of store operations as one all-or-nothing transaction.
pub struct UnitOfWork<S> {
    store: Arc<S>,
}

impl<S> Clone for UnitOfWork<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> UnitOfWork<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Begin a transaction, hand its handle to `work`, then commit on success
    /// or roll back on failure.
    pub async fn run<T, F>(&self, work: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'tx> FnOnce(&'tx mut S::Tx) -> BoxFuture<'tx, Result<T, LedgerError>> + Send,
    {
        self.run_with_cancel(&Cancellation::never(), work).await
    }

    /// Like [`UnitOfWork::run`], but abandons `work` and rolls back as soon as
    /// `cancel` fires.
    #[instrument(level = "debug", skip_all, err)]
    pub async fn run_with_cancel<T, F>(
        &self,
        cancel: &Cancellation,
        work: F,
    ) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'tx> FnOnce(&'tx mut S::Tx) -> BoxFuture<'tx, Result<T, LedgerError>> + Send,
    {
        let mut tx = self.store.begin().await?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LedgerError::Cancelled),
            result = work(&mut tx) => result,
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                debug!("unit of work committed");
                Ok(value)
            }
            Err(cause) => match tx.rollback().await {
                Ok(()) => {
                    debug!(error = %cause, "unit of work rolled back");
                    Err(cause)
                }
                Err(rollback) => {
                    error!(error = %cause, rollback_error = %rollback, "rollback failed");
                    Err(LedgerError::RollbackFailed {
                        cause: Box::new(cause),
                        rollback,
                    })
                }
            },
        }
    }
}
