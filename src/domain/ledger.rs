use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use super::{Account, AccountId, Cents, CentsTotal, Entry, Transfer, TransferId};

/// Sum entry amounts per account.
pub fn entry_sums(entries: &[Entry]) -> HashMap<AccountId, CentsTotal> {
    let mut sums: HashMap<AccountId, CentsTotal> = HashMap::new();
    for entry in entries {
        *sums.entry(entry.account_id).or_insert(0) += CentsTotal::from(entry.amount);
    }
    sums
}

/// A single violated ledger rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum IntegrityIssue {
    /// Stored balance disagrees with the sum of the account's entries
    BalanceDrift {
        account_id: AccountId,
        balance: Cents,
        entry_sum: CentsTotal,
    },
    /// Transfer does not have exactly one debit and one credit leg of its amount
    UnpairedTransfer {
        transfer_id: TransferId,
        leg_count: usize,
    },
    /// Transfer with a zero or negative amount
    InvalidAmount {
        transfer_id: TransferId,
        amount: Cents,
    },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::BalanceDrift {
                account_id,
                balance,
                entry_sum,
            } => write!(
                f,
                "account {} has balance {} but its entries sum to {}",
                account_id, balance, entry_sum
            ),
            IntegrityIssue::UnpairedTransfer {
                transfer_id,
                leg_count,
            } => write!(
                f,
                "transfer {} has {} matching entries, expected a debit and a credit",
                transfer_id, leg_count
            ),
            IntegrityIssue::InvalidAmount {
                transfer_id,
                amount,
            } => write!(f, "transfer {} has non-positive amount {}", transfer_id, amount),
        }
    }
}

/// Outcome of verifying the ledger invariants over committed data.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub account_count: usize,
    pub transfer_count: usize,
    pub entry_count: usize,
    /// Sum of all account balances
    pub total_balance: CentsTotal,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Evaluate conservation and pairing rules over a full snapshot of the ledger.
pub fn build_integrity_report(
    accounts: &[Account],
    transfers: &[Transfer],
    entries: &[Entry],
) -> IntegrityReport {
    let mut issues = Vec::new();

    let sums = entry_sums(entries);
    for account in accounts {
        let entry_sum = sums.get(&account.id).copied().unwrap_or(0);
        if entry_sum != CentsTotal::from(account.balance) {
            issues.push(IntegrityIssue::BalanceDrift {
                account_id: account.id,
                balance: account.balance,
                entry_sum,
            });
        }
    }

    let mut legs: HashMap<TransferId, Vec<&Entry>> = HashMap::new();
    for entry in entries {
        if let Some(transfer_id) = entry.transfer_id {
            legs.entry(transfer_id).or_default().push(entry);
        }
    }

    for transfer in transfers {
        if transfer.amount <= 0 {
            issues.push(IntegrityIssue::InvalidAmount {
                transfer_id: transfer.id,
                amount: transfer.amount,
            });
        }

        let transfer_legs = legs.get(&transfer.id).map(Vec::as_slice).unwrap_or(&[]);
        let has_debit = transfer_legs
            .iter()
            .any(|e| e.account_id == transfer.from_account_id && e.amount == -transfer.amount);
        let has_credit = transfer_legs
            .iter()
            .any(|e| e.account_id == transfer.to_account_id && e.amount == transfer.amount);
        if transfer_legs.len() != 2 || !has_debit || !has_credit {
            issues.push(IntegrityIssue::UnpairedTransfer {
                transfer_id: transfer.id,
                leg_count: transfer_legs.len(),
            });
        }
    }

    IntegrityReport {
        account_count: accounts.len(),
        transfer_count: transfers.len(),
        entry_count: entries.len(),
        total_balance: accounts.iter().map(|a| CentsTotal::from(a.balance)).sum(),
        issues,
    }
}
