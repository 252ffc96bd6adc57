//! DTC trading bridge
//!
//! A client for DTC-protocol trading gateways that rebuilds local
//! trading state from the order and position stream: it maintains the
//! order ledger, tracks the position lifecycle with MAE/MFE capture,
//! derives per-account balances, and persists everything through a
//! SQLite store so a restart or reconnect recovers the same picture.
//!
//! The core runs as two cooperating contexts: a network context that
//! owns the socket, heartbeats, and frame decoding, and a consumer
//! context that routes normalized messages into the ledgers. The
//! presentation layer observes the core only through [`events::CoreEvent`].

pub mod common;
pub mod config;
pub mod dtc;
pub mod error;
pub mod events;
pub mod ledger;
pub mod position;
pub mod recovery;
pub mod router;
pub mod store;
pub mod types;

pub use config::Config;
pub use events::{CoreEvent, HealthState};
pub use ledger::{BalanceLedger, OrderLedgerBuilder};
pub use position::PositionLifecycle;
pub use recovery::RecoveryCoordinator;
pub use router::Router;
pub use store::{open_store, TradeStore};
pub use types::*;
