//! Message router and mode detection
//!
//! Every normalized message lands here. The router derives the message's
//! trading scope from its account string, tracks which scope is active
//! with a debounce so a single stray message cannot flip SIM/LIVE, and
//! dispatches to the order ledger, position lifecycle, and balance
//! ledger. Any message disagreeing with a known active scope disarms the
//! live-order gate immediately until an operator re-arms it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{AccountsConfig, RouterConfig};
use crate::dtc::messages::{NormalizedMessage, OrderUpdate};
use crate::events::{self, CoreEvent, EventSink};
use crate::ledger::{BalanceLedger, LedgerOutcome, OrderLedgerBuilder};
use crate::position::PositionLifecycle;
use crate::recovery::RecoveryCoordinator;
use crate::store::TradeStore;
use crate::types::{Scope, TradingMode};

struct ModeState {
    active: Scope,
    /// First message naming a different scope, pending confirmation
    candidate: Option<(Scope, Instant)>,
}

pub struct Router {
    accounts: AccountsConfig,
    debounce_window: Duration,
    last_known_ttl: chrono::Duration,
    ledger: Mutex<OrderLedgerBuilder>,
    lifecycle: Arc<PositionLifecycle>,
    balance: Arc<BalanceLedger>,
    recovery: Arc<RecoveryCoordinator>,
    store: Arc<dyn TradeStore>,
    sink: EventSink,
    mode: Mutex<ModeState>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: AccountsConfig,
        cfg: &RouterConfig,
        lifecycle: Arc<PositionLifecycle>,
        balance: Arc<BalanceLedger>,
        recovery: Arc<RecoveryCoordinator>,
        store: Arc<dyn TradeStore>,
        sink: EventSink,
    ) -> Self {
        Router {
            accounts,
            debounce_window: cfg.debounce_window(),
            last_known_ttl: cfg.last_known_mode_ttl(),
            ledger: Mutex::new(OrderLedgerBuilder::new()),
            lifecycle,
            balance,
            recovery,
            store,
            sink,
            mode: Mutex::new(ModeState {
                active: Scope::unknown(),
                candidate: None,
            }),
        }
    }

    /// Map an account string onto a trading scope
    pub fn scope_for(&self, account: &str) -> Scope {
        if self
            .accounts
            .live_account
            .as_deref()
            .is_some_and(|live| live == account)
        {
            return Scope::live(account);
        }
        if !account.is_empty() && account.starts_with(&self.accounts.sim_prefix) {
            return Scope::sim(account);
        }
        Scope::unknown()
    }

    pub fn active_scope(&self) -> Scope {
        self.mode
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .clone()
    }

    /// Seed the active scope from persisted state. Accepted only while
    /// no live traffic has confirmed a mode and only inside the TTL;
    /// anything older is treated as unknown.
    pub fn seed_last_known(&self, scope: Scope, as_of: chrono::DateTime<chrono::Utc>) {
        if chrono::Utc::now() - as_of > self.last_known_ttl {
            debug!(scope = %scope, as_of = %as_of, "Persisted mode is past its TTL, ignoring");
            return;
        }
        let mut mode = self.mode.lock().unwrap_or_else(|e| e.into_inner());
        if mode.active.is_known() {
            return;
        }
        info!(scope = %scope, "Seeding provisional mode from persisted state");
        mode.active = scope.clone();
        drop(mode);
        events::emit(&self.sink, CoreEvent::ModeChanged(scope));
    }

    /// Route one inbound message
    pub fn handle(&self, message: &NormalizedMessage) {
        self.recovery.observe(message);

        let scope = message.account().map(|a| self.scope_for(a));
        if let Some(scope) = &scope {
            if scope.is_known() {
                self.observe_mode(scope);
            } else if let Some(account) = message.account() {
                if !account.is_empty() {
                    debug!(account, "Message from unrecognized account, dropping");
                    return;
                }
            }
        }

        match message {
            NormalizedMessage::OrderUpdate(update) => {
                if let Some(scope) = scope.filter(|s| s.is_known()) {
                    self.handle_order(&scope, update);
                }
            }
            NormalizedMessage::PositionUpdate(update) => {
                if let Some(scope) = scope.filter(|s| s.is_known()) {
                    if let Err(e) = self.lifecycle.apply_update(&scope, update) {
                        warn!(scope = %scope, error = %e, "Position reconcile failed");
                    }
                }
            }
            NormalizedMessage::AccountBalanceUpdate(update) => {
                if let Some(scope) = scope.filter(|s| s.is_known()) {
                    self.balance.apply_broker_update(&scope, update);
                    if scope.mode == TradingMode::Sim {
                        if let Err(e) = self.balance.refresh_sim(&scope) {
                            warn!(scope = %scope, error = %e, "SIM balance refresh failed");
                        }
                    }
                }
            }
            NormalizedMessage::TradeAccountResponse(resp) => {
                info!(account = %resp.account, "Gateway listed trade account");
            }
            NormalizedMessage::Heartbeat { .. } | NormalizedMessage::Logon { .. } => {}
        }
    }

    fn handle_order(&self, scope: &Scope, update: &OrderUpdate) {
        let (outcome, entry) = {
            let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
            let outcome = ledger.apply(update);
            let entry = ledger.get(&update.order_id).cloned();
            (outcome, entry)
        };

        if let Some(entry) = &entry {
            if !matches!(outcome, LedgerOutcome::Skipped | LedgerOutcome::Frozen) {
                if let Err(e) = self.store.record_order(entry) {
                    warn!(order_id = %entry.order_id, error = %e, "Order record write failed");
                }
            }
        }

        // Working protective orders define the position's stop and target
        if let Some(entry) = &entry {
            if !entry.is_terminal() {
                let stop = update.stop_price;
                let target = match entry.kind {
                    Some(crate::types::OrderKind::Limit) => update.price,
                    _ => None,
                };
                if stop.is_some() || target.is_some() {
                    if let Err(e) = self.lifecycle.set_protective_prices(scope, stop, target) {
                        warn!(scope = %scope, error = %e, "Protective price update failed");
                    }
                }
            }
        }

        if let LedgerOutcome::Filled(fill) = outcome {
            debug!(
                scope = %scope,
                order_id = %fill.order_id,
                quantity = fill.quantity,
                price = fill.price,
                "Fill routed to position lifecycle"
            );
            if let Err(e) = self.lifecycle.on_fill(scope, &fill) {
                warn!(scope = %scope, error = %e, "Fill application failed");
                return;
            }
            if scope.mode == TradingMode::Sim {
                if let Err(e) = self.balance.refresh_sim(scope) {
                    warn!(scope = %scope, error = %e, "SIM balance refresh failed");
                }
            }
        }
    }

    /// Scope drift handling. Any message disagreeing with a known active
    /// scope disarms the live gate on the spot; the active scope itself
    /// only switches once a second agreeing message lands inside the
    /// debounce window.
    fn observe_mode(&self, scope: &Scope) {
        enum Observed {
            Drift(Scope),
            Switched(Scope),
        }

        let observed = {
            let mut mode = self.mode.lock().unwrap_or_else(|e| e.into_inner());
            if mode.active == *scope {
                mode.candidate = None;
                return;
            }

            match mode.candidate.take() {
                Some((candidate, seen))
                    if candidate == *scope && seen.elapsed() <= self.debounce_window =>
                {
                    Observed::Switched(std::mem::replace(&mut mode.active, scope.clone()))
                }
                _ => {
                    mode.candidate = Some((scope.clone(), Instant::now()));
                    Observed::Drift(mode.active.clone())
                }
            }
        };

        match observed {
            Observed::Drift(active) if active.is_known() => {
                warn!(
                    active = %active,
                    seen = %scope,
                    "Message scope disagrees with active mode, live gate disarmed"
                );
                events::emit(
                    &self.sink,
                    CoreEvent::LiveGateDisarmed {
                        reason: format!(
                            "message scope {} disagrees with active {}",
                            scope, active
                        ),
                    },
                );
            }
            Observed::Drift(_) => {}
            Observed::Switched(previous) => {
                if previous.is_known() {
                    warn!(from = %previous, to = %scope, "Trading scope switched after confirmed drift");
                } else {
                    info!(scope = %scope, "Trading scope confirmed");
                }
                events::emit(&self.sink, CoreEvent::ModeChanged(scope.clone()));
            }
        }
    }

    /// Last fill timestamp seen this session, feeding the next recovery
    /// pull when the store is empty
    pub fn last_fill_ts(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_fill_ts()
    }

    pub fn open_order_count(&self) -> usize {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .open_order_count()
    }
}
