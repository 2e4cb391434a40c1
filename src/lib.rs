pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod storage;
pub mod telemetry;

pub use application::{LedgerError, TransferEngine, TransferOutcome, UnitOfWork};
pub use domain::*;
pub use storage::{LedgerStore, LedgerTx, MemoryStore, SqliteStore, StoreError};
