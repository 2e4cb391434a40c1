use tracing::info;

use crate::domain::{IntegrityReport, build_integrity_report};
use crate::storage::LedgerStore;

use super::LedgerError;

/// Verify conservation and entry pairing over everything committed so far.
///
/// Reads are not taken in one snapshot, so run this against a quiescent
/// ledger for an exact answer.
pub async fn check_integrity<S: LedgerStore>(store: &S) -> Result<IntegrityReport, LedgerError> {
    let accounts = store.list_accounts().await?;
    let transfers = store.list_transfers().await?;
    let entries = store.list_all_entries().await?;

    let report = build_integrity_report(&accounts, &transfers, &entries);
    info!(
        accounts = report.account_count,
        transfers = report.transfer_count,
        entries = report.entry_count,
        issues = report.issues.len(),
        "integrity check finished"
    );
    Ok(report)
}
