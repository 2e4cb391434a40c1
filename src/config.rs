use std::time::Duration;

use clap::Args;

use crate::application::RetryPolicy;
use crate::storage::SqliteOptions;

/// Runtime settings, taken from flags with environment fallbacks.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Database file path
    #[arg(short, long, global = true, env = "LEDGER_DATABASE", default_value = "ledger.db")]
    pub database: String,

    /// Maximum pooled database connections
    #[arg(long, global = true, env = "LEDGER_MAX_CONNECTIONS", default_value_t = 8,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub max_connections: u32,

    /// Milliseconds to wait on the database write lock before reporting a conflict
    #[arg(long, global = true, env = "LEDGER_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub busy_timeout_ms: u64,

    /// Attempts per transfer when the store reports a transient conflict
    #[arg(long, global = true, env = "LEDGER_MAX_ATTEMPTS", default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Milliseconds to wait between transfer attempts
    #[arg(long, global = true, env = "LEDGER_RETRY_DELAY_MS", default_value_t = 100)]
    pub retry_delay_ms: u64,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            max_connections: self.max_connections,
            busy_timeout: self.busy_timeout,
        }
    }
}

impl From<ConfigArgs> for Config {
    fn from(args: ConfigArgs) -> Self {
        Self {
            database: args.database,
            max_connections: args.max_connections,
            busy_timeout: Duration::from_millis(args.busy_timeout_ms),
            retry: RetryPolicy {
                max_attempts: args.max_attempts,
                delay: Duration::from_millis(args.retry_delay_ms),
            },
        }
    }
}
