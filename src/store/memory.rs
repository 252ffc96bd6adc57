//! In-memory trade store
//!
//! Last link of the fallback chain and the default for tests. Mirrors
//! the SQLite surface, including the one-open-position-per-scope
//! constraint and the idempotent close.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{CloseOutcome, TradeStore};
use crate::error::StoreError;
use crate::ledger::orders::OrderLedgerEntry;
use crate::position::metrics::{self, ExitFill};
use crate::types::{BalanceRecord, ClosedTrade, OpenPosition, Scope};

#[derive(Default)]
struct Inner {
    positions: HashMap<Scope, OpenPosition>,
    trades: Vec<ClosedTrade>,
    orders: Vec<OrderLedgerEntry>,
    snapshots: Vec<(Scope, BalanceRecord)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TradeStore for MemoryStore {
    fn open_position(&self, position: &OpenPosition) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.positions.contains_key(&position.scope) {
            return Err(StoreError::PositionExists(position.scope.to_string()));
        }
        inner.positions.insert(position.scope.clone(), position.clone());
        Ok(())
    }

    fn update_position(&self, position: &OpenPosition) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.positions.get_mut(&position.scope) {
            *existing = position.clone();
        }
        Ok(())
    }

    fn get_position(&self, scope: &Scope) -> Result<Option<OpenPosition>, StoreError> {
        Ok(self.lock().positions.get(scope).cloned())
    }

    fn list_positions(&self) -> Result<Vec<OpenPosition>, StoreError> {
        let inner = self.lock();
        let mut positions: Vec<_> = inner.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.scope.to_string().cmp(&b.scope.to_string()));
        Ok(positions)
    }

    fn close_position(&self, scope: &Scope, exit: &ExitFill) -> Result<CloseOutcome, StoreError> {
        let mut inner = self.lock();
        let Some(position) = inner.positions.remove(scope) else {
            return Ok(CloseOutcome::AlreadyClosed);
        };
        let trade = metrics::build_closed_trade(&position, exit);
        inner.trades.push(trade.clone());
        Ok(CloseOutcome::Closed(trade))
    }

    fn list_trades(&self, scope: Option<&Scope>) -> Result<Vec<ClosedTrade>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .trades
            .iter()
            .filter(|t| scope.map_or(true, |s| &t.scope == s))
            .cloned()
            .collect())
    }

    fn realized_pnl_sum(&self, scope: &Scope) -> Result<f64, StoreError> {
        let inner = self.lock();
        Ok(inner
            .trades
            .iter()
            .filter(|t| &t.scope == scope)
            .map(|t| t.realized_pnl)
            .sum())
    }

    fn record_order(&self, entry: &OrderLedgerEntry) -> Result<(), StoreError> {
        self.lock().orders.push(entry.clone());
        Ok(())
    }

    fn append_balance_snapshot(
        &self,
        scope: &Scope,
        record: &BalanceRecord,
    ) -> Result<(), StoreError> {
        self.lock().snapshots.push((scope.clone(), *record));
        Ok(())
    }

    fn last_recorded_fill_ts(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .orders
            .iter()
            .filter(|o| o.filled_quantity > 0.0)
            .map(|o| o.last_seen)
            .max())
    }
}
