use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::application::{TransferEngine, TransferOutcome, check_integrity};
use crate::config::{Config, ConfigArgs};
use crate::domain::{
    Account, AccountId, Entry, NewAccount, TransferId, TransferRequest, format_cents, parse_cents,
};
use crate::storage::{LedgerStore, SqliteStore};

/// ledger-tx - double-entry ledger with atomic transfers
#[derive(Parser)]
#[command(name = "ledger-tx")]
#[command(about = "Record transfers between accounts in a double-entry ledger")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Account management commands
    #[command(subcommand)]
    Account(AccountCommands),

    /// Move money between two accounts
    Transfer {
        /// Amount to transfer (e.g., "50.00" or "50")
        amount: String,

        /// Source account id
        #[arg(long)]
        from: AccountId,

        /// Destination account id
        #[arg(long)]
        to: AccountId,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// List entries for an account
    Entries {
        /// Account id
        account: AccountId,
    },

    /// Show a transfer and its entries
    #[command(name = "show")]
    ShowTransfer {
        /// Transfer id
        id: TransferId,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify ledger integrity
    Check,
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Open a new account
    Open {
        /// Account owner
        owner: String,

        /// Currency code (e.g., USD, EUR)
        currency: String,

        /// Opening balance (e.g., "1000.00")
        #[arg(long, default_value = "0")]
        balance: String,
    },

    /// Show one account
    Show {
        /// Account id
        id: AccountId,
    },

    /// List all accounts
    List,

    /// Overwrite an account balance (administrative, writes no entry)
    SetBalance {
        /// Account id
        id: AccountId,

        /// New balance
        #[arg(allow_hyphen_values = true)]
        balance: String,
    },

    /// Delete an account with no entries or transfers
    Delete {
        /// Account id
        id: AccountId,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = Config::from(self.config);

        match self.command {
            Commands::Init => {
                let store = SqliteStore::init(&config.database, &config.sqlite_options())
                    .await
                    .context("Failed to initialize database")?;
                store.close().await;
                println!("Database initialized: {}", config.database);
            }

            Commands::Account(account_cmd) => {
                let store = connect(&config).await?;
                run_account_command(&store, account_cmd).await?;
            }

            Commands::Transfer {
                amount,
                from,
                to,
                json,
            } => {
                let store = connect(&config).await?;
                let amount =
                    parse_cents(&amount).context("Invalid amount format. Use '50.00' or '50'")?;

                let engine = TransferEngine::with_policy(Arc::new(store), config.retry);
                let outcome = engine
                    .transfer(TransferRequest::new(from, to, amount))
                    .await
                    .context("Transfer failed")?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    print_outcome(&outcome);
                }
            }

            Commands::Entries { account } => {
                let store = connect(&config).await?;
                let account = store.get_account(account).await?;
                let entries = store.list_entries(account.id).await?;
                print_account(&account);
                println!();
                print_entries(&entries);
            }

            Commands::ShowTransfer { id, json } => {
                let store = connect(&config).await?;
                let transfer = store.get_transfer(id).await?;
                let entries = store.entries_for_transfer(id).await?;

                if json {
                    let value = serde_json::json!({
                        "transfer": transfer,
                        "entries": entries,
                    });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                } else {
                    println!("Transfer: {}", transfer.id);
                    println!(
                        "  Date:    {}",
                        transfer.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                    println!("  Amount:  {}", format_cents(transfer.amount));
                    println!("  From:    account {}", transfer.from_account_id);
                    println!("  To:      account {}", transfer.to_account_id);
                    println!();
                    print_entries(&entries);
                }
            }

            Commands::Check => {
                let store = connect(&config).await?;
                run_check_command(&store).await?;
            }
        }

        Ok(())
    }
}

async fn connect(config: &Config) -> Result<SqliteStore> {
    SqliteStore::connect(&config.database, &config.sqlite_options())
        .await
        .with_context(|| {
            format!(
                "Failed to open {}. Run 'ledger-tx init' first",
                config.database
            )
        })
}

async fn run_account_command(store: &SqliteStore, cmd: AccountCommands) -> Result<()> {
    match cmd {
        AccountCommands::Open {
            owner,
            currency,
            balance,
        } => {
            let balance = parse_cents(&balance).context("Invalid opening balance")?;
            let account = store
                .create_account(NewAccount::new(owner, currency.to_uppercase()).with_balance(balance))
                .await?;
            println!("Opened account {}", account.id);
            print_account(&account);
        }

        AccountCommands::Show { id } => {
            let account = store.get_account(id).await?;
            print_account(&account);
        }

        AccountCommands::List => {
            let accounts = store.list_accounts().await?;
            if accounts.is_empty() {
                println!("No accounts found.");
                return Ok(());
            }
            println!("{:<6} {:<20} {:<8} {:>14}", "ID", "OWNER", "CURRENCY", "BALANCE");
            println!("{}", "-".repeat(51));
            for account in accounts {
                println!(
                    "{:<6} {:<20} {:<8} {:>14}",
                    account.id,
                    account.owner,
                    account.currency,
                    format_cents(account.balance)
                );
            }
        }

        AccountCommands::SetBalance { id, balance } => {
            let balance = parse_cents(&balance).context("Invalid balance")?;
            let account = store.set_account_balance(id, balance).await?;
            println!("Balance overridden; entries no longer reconcile with this account.");
            print_account(&account);
        }

        AccountCommands::Delete { id } => {
            store.delete_account(id).await?;
            println!("Deleted account {}", id);
        }
    }

    Ok(())
}

async fn run_check_command(store: &SqliteStore) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = check_integrity(store).await?;

    println!("Accounts:  {}", report.account_count);
    println!("Transfers: {}", report.transfer_count);
    println!("Entries:   {}", report.entry_count);
    println!("Total balance: {}", format_cents(report.total_balance));
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("Ledger integrity check failed");
    }

    Ok(())
}

fn print_account(account: &Account) {
    println!("Account {}", account.id);
    println!("  Owner:    {}", account.owner);
    println!("  Currency: {}", account.currency);
    println!("  Balance:  {}", format_cents(account.balance));
    println!(
        "  Opened:   {}",
        account.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn print_entries(entries: &[Entry]) {
    if entries.is_empty() {
        println!("No entries.");
        return;
    }
    println!("{:<6} {:<8} {:<9} {:>14}  DATE", "ID", "ACCOUNT", "TRANSFER", "AMOUNT");
    println!("{}", "-".repeat(60));
    for entry in entries {
        let transfer = entry
            .transfer_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "opening".to_string());
        println!(
            "{:<6} {:<8} {:<9} {:>14}  {}",
            entry.id,
            entry.account_id,
            transfer,
            format_cents(entry.amount),
            entry.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_outcome(outcome: &TransferOutcome) {
    println!(
        "Recorded transfer {}: {} from account {} to account {}",
        outcome.transfer.id,
        format_cents(outcome.transfer.amount),
        outcome.transfer.from_account_id,
        outcome.transfer.to_account_id
    );
    println!(
        "  Account {} balance: {}",
        outcome.from_account.id,
        format_cents(outcome.from_account.balance)
    );
    println!(
        "  Account {} balance: {}",
        outcome.to_account.id,
        format_cents(outcome.to_account.balance)
    );
}
