use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Cents;

pub type AccountId = i64;

/// A balance-holding party. The balance only moves through signed deltas
/// applied inside a unit of work (or the explicit administrative override).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    /// ISO 4217 style currency code, e.g. "USD"
    pub currency: String,
    /// Current balance in minor units
    pub balance: Cents,
    pub created_at: DateTime<Utc>,
}

/// Parameters for opening an account. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub owner: String,
    pub currency: String,
    /// Opening balance, recorded as an opening entry when non-zero
    pub balance: Cents,
}

impl NewAccount {
    pub fn new(owner: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            currency: currency.into(),
            balance: 0,
        }
    }

    pub fn with_balance(mut self, balance: Cents) -> Self {
        self.balance = balance;
        self
    }
}
