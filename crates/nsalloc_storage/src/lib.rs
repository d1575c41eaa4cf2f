#![forbid(unsafe_code)]

pub mod ledger;
pub mod memory;
pub mod sqlite;

pub use ledger::{is_allowed_status_transition, AllocationStore, AllocationTx, StorageError};
pub use memory::LedgerStore;
pub use sqlite::SqliteLedgerStore;
