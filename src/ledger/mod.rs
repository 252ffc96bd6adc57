//! Order and balance ledgers

pub mod balance;
pub mod orders;

pub use balance::BalanceLedger;
pub use orders::{FillEvent, LedgerOutcome, OrderLedgerBuilder, OrderLedgerEntry};
