// Application layer: the unit-of-work executor and the transfer
// orchestrator built on it. Everything here is storage-agnostic and works
// against any `LedgerStore`.

mod cancel;
mod error;
mod integrity;
mod transfer;
mod unit_of_work;

pub use cancel::*;
pub use error::*;
pub use integrity::*;
pub use transfer::*;
pub use unit_of_work::*;
