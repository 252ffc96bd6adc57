//! Per-scope balance ledger
//!
//! SIM balances are never taken from the wire: the gateway's simulated
//! balance resets on its own schedule, so the SIM figure is derived from
//! the configured starting balance plus the sum of realized P&L in the
//! store. LIVE balances are authoritative from the broker and are
//! snapshotted for audit.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::AccountsConfig;
use crate::dtc::messages::AccountBalanceUpdate;
use crate::events::{self, CoreEvent, EventSink};
use crate::store::TradeStore;
use crate::types::{BalanceRecord, Scope, TradingMode};

pub struct BalanceLedger {
    store: Arc<dyn TradeStore>,
    accounts: AccountsConfig,
    sink: EventSink,
    /// Last published record per scope
    cache: Mutex<HashMap<Scope, BalanceRecord>>,
    /// Records staged since the last flush; a burst of wire updates
    /// collapses into one notification per scope
    pending: Mutex<HashMap<Scope, BalanceRecord>>,
}

impl BalanceLedger {
    pub fn new(store: Arc<dyn TradeStore>, accounts: AccountsConfig, sink: EventSink) -> Self {
        BalanceLedger {
            store,
            accounts,
            sink,
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Recompute a SIM scope's balance from the trade history.
    ///
    /// balance = starting balance + sum of realized P&L, commissions
    /// already netted into each trade. Daily P&L is the sum over trades
    /// closed today (UTC).
    pub fn refresh_sim(&self, scope: &Scope) -> Result<BalanceRecord, crate::error::StoreError> {
        let realized = self.store.realized_pnl_sum(scope)?;
        let today = Utc::now().date_naive();
        let daily: f64 = self
            .store
            .list_trades(Some(scope))?
            .iter()
            .filter(|t| t.exit_time.date_naive() == today)
            .map(|t| t.realized_pnl)
            .sum();

        let record = BalanceRecord {
            balance: self.accounts.sim_starting_balance + realized,
            open_pnl: 0.0,
            daily_pnl: daily,
            as_of: Utc::now(),
        };
        debug!(
            scope = %scope,
            balance = record.balance,
            daily_pnl = record.daily_pnl,
            "SIM balance refreshed from ledger"
        );
        self.stage(scope, record);
        Ok(record)
    }

    /// Apply a broker-reported balance. Only LIVE scopes accept these;
    /// a SIM scope's wire balance is dropped so gateway resets cannot
    /// corrupt the derived figure.
    pub fn apply_broker_update(&self, scope: &Scope, update: &AccountBalanceUpdate) {
        if scope.mode != TradingMode::Live {
            debug!(
                scope = %scope,
                wire_balance = update.cash_balance,
                "Ignoring wire balance for non-LIVE scope"
            );
            return;
        }

        let record = BalanceRecord {
            balance: update.cash_balance,
            open_pnl: update.open_pnl,
            daily_pnl: update.daily_pnl,
            as_of: Utc::now(),
        };
        if let Err(e) = self.store.append_balance_snapshot(scope, &record) {
            warn!(scope = %scope, error = %e, "Failed to snapshot LIVE balance");
        }
        self.stage(scope, record);
    }

    /// Freshest known record: staged first, then last published
    pub fn get(&self, scope: &Scope) -> Option<BalanceRecord> {
        if let Some(record) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(scope)
        {
            return Some(*record);
        }
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(scope)
            .copied()
    }

    /// Publish staged records whose figures moved since the last flush.
    /// Driven by the supervisor's flush loop alongside the position
    /// flush; nothing emits once per inbound message.
    pub fn flush_dirty(&self) {
        let staged: Vec<(Scope, BalanceRecord)> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        for (scope, record) in staged {
            let changed = {
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                let prev = cache.insert(scope.clone(), record);
                prev.map_or(true, |p| {
                    p.balance != record.balance
                        || p.open_pnl != record.open_pnl
                        || p.daily_pnl != record.daily_pnl
                })
            };
            // Notify outside the lock; a slow consumer must not
            // serialize balance writers.
            if changed {
                events::emit(
                    &self.sink,
                    CoreEvent::BalanceChanged {
                        scope,
                        balance: record,
                    },
                );
            }
        }
    }

    fn stage(&self, scope: &Scope, record: BalanceRecord) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scope.clone(), record);
    }
}
