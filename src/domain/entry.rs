use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, Cents, TransferId};

pub type EntryId = i64;

/// One signed balance movement against exactly one account.
/// Entries are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    /// The transfer this entry is a leg of. `None` for opening entries and
    /// for entries whose transfer was deleted administratively.
    pub transfer_id: Option<TransferId>,
    /// Negative for debits, positive for credits
    pub amount: Cents,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewEntry {
    pub account_id: AccountId,
    pub transfer_id: Option<TransferId>,
    pub amount: Cents,
}

impl NewEntry {
    /// A transfer leg.
    pub fn leg(transfer_id: TransferId, account_id: AccountId, amount: Cents) -> Self {
        Self {
            account_id,
            transfer_id: Some(transfer_id),
            amount,
        }
    }

    /// An opening entry recording an account's initial balance.
    pub fn opening(account_id: AccountId, amount: Cents) -> Self {
        Self {
            account_id,
            transfer_id: None,
            amount,
        }
    }
}
