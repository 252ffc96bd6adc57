//! Durable trade state
//!
//! [`TradeStore`] is the only surface PositionLifecycle and BalanceLedger
//! talk to. The SQLite implementation is primary; opening the store walks
//! a fallback chain (primary path, secondary path, in-memory) so the core
//! degrades instead of crashing when a database cannot be opened.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ledger::orders::OrderLedgerEntry;
use crate::position::metrics::ExitFill;
use crate::types::{BalanceRecord, ClosedTrade, OpenPosition, Scope};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Result of the atomic close operation
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed(ClosedTrade),
    /// No open position for the scope; duplicate close triggers land here
    AlreadyClosed,
}

/// CRUD plus the atomic close against the relational layout
pub trait TradeStore: Send + Sync {
    /// Insert a new open position; refuses a second row for the scope
    fn open_position(&self, position: &OpenPosition) -> Result<(), StoreError>;

    /// Write-through update of an existing open position
    fn update_position(&self, position: &OpenPosition) -> Result<(), StoreError>;

    fn get_position(&self, scope: &Scope) -> Result<Option<OpenPosition>, StoreError>;

    fn list_positions(&self) -> Result<Vec<OpenPosition>, StoreError>;

    /// In one transaction: read the open position, build the closed
    /// trade, insert it, delete the position. Finding no row is a no-op.
    fn close_position(&self, scope: &Scope, exit: &ExitFill) -> Result<CloseOutcome, StoreError>;

    /// Closed trades, newest last; optionally filtered to one scope
    fn list_trades(&self, scope: Option<&Scope>) -> Result<Vec<ClosedTrade>, StoreError>;

    /// Sum of realized P&L over all closed trades of a scope
    fn realized_pnl_sum(&self, scope: &Scope) -> Result<f64, StoreError>;

    /// Append-only audit of terminal order state
    fn record_order(&self, entry: &OrderLedgerEntry) -> Result<(), StoreError>;

    /// Append-only balance history
    fn append_balance_snapshot(
        &self,
        scope: &Scope,
        record: &BalanceRecord,
    ) -> Result<(), StoreError>;

    /// Most recent fill-bearing audit timestamp, the since-anchor for
    /// the recovery pull across restarts
    fn last_recorded_fill_ts(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Bounded-retry wrapper around another store's writes.
///
/// A write that keeps failing surfaces `RetriesExhausted` to the caller;
/// the previous durable state remains authoritative.
pub struct RetryingStore<S> {
    inner: S,
    retries: u32,
    retry_delay: Duration,
}

impl<S: TradeStore> RetryingStore<S> {
    pub fn new(inner: S, retries: u32) -> Self {
        Self {
            inner,
            retries,
            retry_delay: Duration::from_millis(50),
        }
    }

    fn with_retries<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let attempts = self.retries.max(1);
        let mut last: Option<StoreError> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                std::thread::sleep(self.retry_delay);
            }
            match op() {
                Ok(v) => return Ok(v),
                // Logical refusals are not transient; surface immediately
                Err(e @ StoreError::PositionExists(_)) => return Err(e),
                Err(e) => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt + 1, attempts, e);
                    last = Some(e);
                }
            }
        }
        Err(StoreError::RetriesExhausted {
            attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

impl<S: TradeStore> TradeStore for RetryingStore<S> {
    fn open_position(&self, position: &OpenPosition) -> Result<(), StoreError> {
        self.with_retries("open_position", || self.inner.open_position(position))
    }

    fn update_position(&self, position: &OpenPosition) -> Result<(), StoreError> {
        self.with_retries("update_position", || self.inner.update_position(position))
    }

    fn get_position(&self, scope: &Scope) -> Result<Option<OpenPosition>, StoreError> {
        self.inner.get_position(scope)
    }

    fn list_positions(&self) -> Result<Vec<OpenPosition>, StoreError> {
        self.inner.list_positions()
    }

    fn close_position(&self, scope: &Scope, exit: &ExitFill) -> Result<CloseOutcome, StoreError> {
        self.with_retries("close_position", || self.inner.close_position(scope, exit))
    }

    fn list_trades(&self, scope: Option<&Scope>) -> Result<Vec<ClosedTrade>, StoreError> {
        self.inner.list_trades(scope)
    }

    fn realized_pnl_sum(&self, scope: &Scope) -> Result<f64, StoreError> {
        self.inner.realized_pnl_sum(scope)
    }

    fn record_order(&self, entry: &OrderLedgerEntry) -> Result<(), StoreError> {
        self.with_retries("record_order", || self.inner.record_order(entry))
    }

    fn append_balance_snapshot(
        &self,
        scope: &Scope,
        record: &BalanceRecord,
    ) -> Result<(), StoreError> {
        self.with_retries("append_balance_snapshot", || {
            self.inner.append_balance_snapshot(scope, record)
        })
    }

    fn last_recorded_fill_ts(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.last_recorded_fill_ts()
    }
}

/// Open the backing store, degrading along the fallback chain:
/// primary path, secondary path, then in-memory.
pub fn open_store(config: &StoreConfig) -> Arc<dyn TradeStore> {
    match SqliteStore::open(&config.primary_path) {
        Ok(store) => {
            info!("State store: sqlite at {}", config.primary_path);
            return Arc::new(RetryingStore::new(store, config.write_retries));
        }
        Err(e) => {
            error!("Primary store {} unavailable: {}", config.primary_path, e);
        }
    }

    if let Some(secondary) = &config.secondary_path {
        match SqliteStore::open(secondary) {
            Ok(store) => {
                warn!("State store: fell back to secondary at {}", secondary);
                return Arc::new(RetryingStore::new(store, config.write_retries));
            }
            Err(e) => {
                error!("Secondary store {} unavailable: {}", secondary, e);
            }
        }
    }

    warn!("State store: in-memory only, positions will not survive a restart");
    Arc::new(MemoryStore::new())
}
