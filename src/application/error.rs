use thiserror::Error;

use crate::domain::TransferRequestError;
use crate::storage::{ErrorKind, StoreError};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] TransferRequestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: StoreError,
    },

    #[error("{cause}; rollback also failed: {rollback}")]
    RollbackFailed {
        cause: Box<LedgerError>,
        rollback: StoreError,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            LedgerError::Store(err) => err.kind(),
            LedgerError::RetriesExhausted { .. } => ErrorKind::Conflict,
            LedgerError::RollbackFailed { .. } => ErrorKind::Unavailable,
            LedgerError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the whole unit of work may be attempted again.
    ///
    /// Only a bare store conflict qualifies; a conflict whose rollback failed
    /// left the connection in an unknown state and is not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Store(err) if err.is_conflict())
    }
}
