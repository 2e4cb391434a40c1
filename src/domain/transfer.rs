use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{AccountId, Cents};

pub type TransferId = i64;

/// A logical movement of money linking two accounts. Exactly two entries
/// belong to it: `-amount` on the source and `+amount` on the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    /// Source account (balance decreases)
    pub from_account_id: AccountId,
    /// Destination account (balance increases)
    pub to_account_id: AccountId,
    /// Always positive
    pub amount: Cents,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferRequestError {
    #[error("account id must be positive, got {0}")]
    InvalidAccountId(AccountId),

    #[error("cannot transfer from account {0} to itself")]
    SameAccount(AccountId),

    #[error("transfer amount must be positive, got {0}")]
    NonPositiveAmount(Cents),
}

/// A validated-shape request to move `amount` from one account to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Cents,
}

impl TransferRequest {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: Cents) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Check the preconditions that must hold before any storage is touched.
    pub fn validate(&self) -> Result<(), TransferRequestError> {
        for id in [self.from_account_id, self.to_account_id] {
            if id <= 0 {
                return Err(TransferRequestError::InvalidAccountId(id));
            }
        }
        if self.from_account_id == self.to_account_id {
            return Err(TransferRequestError::SameAccount(self.from_account_id));
        }
        if self.amount <= 0 {
            return Err(TransferRequestError::NonPositiveAmount(self.amount));
        }
        Ok(())
    }

    /// The two balance deltas, ordered by ascending account id.
    ///
    /// Row locks are taken in this order regardless of direction, so two
    /// transfers between the same pair of accounts never wait on each other
    /// in a cycle.
    pub fn balance_deltas(&self) -> [(AccountId, Cents); 2] {
        let debit = (self.from_account_id, -self.amount);
        let credit = (self.to_account_id, self.amount);
        if self.from_account_id < self.to_account_id {
            [debit, credit]
        } else {
            [credit, debit]
        }
    }
}
