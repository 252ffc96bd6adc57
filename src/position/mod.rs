//! Position lifecycle
//!
//! Flat -> Open -> Flat transitions driven by order fills, with broker
//! position snapshots used to reconcile. All transitions write through
//! to the store before any event is emitted, so a crash between the two
//! loses a notification but never a state change.

pub mod metrics;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{AccountsConfig, StoreConfig};
use crate::dtc::messages::PositionUpdate;
use crate::error::StoreError;
use crate::events::{self, CoreEvent, EventSink};
use crate::ledger::FillEvent;
use crate::store::{CloseOutcome, TradeStore};
use crate::types::{OpenPosition, Scope, Side, Symbol, TradingMode};

use metrics::ExitFill;

pub struct PositionLifecycle {
    store: Arc<dyn TradeStore>,
    accounts: AccountsConfig,
    staleness: chrono::Duration,
    sink: EventSink,
    /// Last traded price seen per scope, used as the exit price when the
    /// broker reports flat without a price attached
    last_price: Mutex<HashMap<Scope, f64>>,
    /// Scopes whose open position changed since the last flush, with a
    /// sticky needs-confirmation flag. All position publication goes
    /// through here; nothing emits once per inbound message.
    dirty: Mutex<HashMap<Scope, bool>>,
}

impl PositionLifecycle {
    pub fn new(
        store: Arc<dyn TradeStore>,
        accounts: AccountsConfig,
        store_cfg: &StoreConfig,
        sink: EventSink,
    ) -> Self {
        PositionLifecycle {
            store,
            accounts,
            staleness: store_cfg.staleness_window(),
            sink,
            last_price: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashMap::new()),
        }
    }

    /// Fold a fill into the scope's position: open, add, reduce, close,
    /// or reverse depending on the resting state.
    pub fn on_fill(&self, scope: &Scope, fill: &FillEvent) -> Result<(), StoreError> {
        self.note_price(scope, fill.price);
        let existing = self.store.get_position(scope)?;

        match existing {
            None => self.open_from_fill(scope, fill),
            Some(pos) if pos.side == fill.side => self.add_to_position(pos, fill),
            Some(pos) => {
                let open_qty = pos.abs_quantity();
                if fill.quantity < open_qty {
                    self.reduce_position(pos, fill)
                } else {
                    let remainder = fill.quantity - open_qty;
                    self.close(scope, fill.price, fill.timestamp)?;
                    if remainder > 0.0 {
                        let mut flipped = fill.clone();
                        flipped.quantity = remainder;
                        self.open_from_fill(scope, &flipped)?;
                    }
                    Ok(())
                }
            }
        }
    }

    /// Reconcile a broker position snapshot against local state. The
    /// broker wins on quantity and entry price; a flat snapshot closes
    /// whatever is resting locally.
    pub fn apply_update(&self, scope: &Scope, update: &PositionUpdate) -> Result<(), StoreError> {
        if update.quantity == 0.0 {
            if self.store.get_position(scope)?.is_some() {
                let exit_price = self.exit_price_hint(scope, update);
                debug!(scope = %scope, exit_price, "Broker reports flat, closing local position");
                self.close(scope, exit_price, Utc::now())?;
            }
            return Ok(());
        }

        let side = if update.quantity > 0.0 {
            Side::Buy
        } else {
            Side::Sell
        };

        match self.store.get_position(scope)? {
            None => {
                let position = self.build_position(
                    scope,
                    update.symbol.clone(),
                    side,
                    update.quantity.abs(),
                    update.avg_price,
                    Utc::now(),
                );
                self.store.open_position(&position)?;
                info!(
                    scope = %scope,
                    symbol = %position.symbol,
                    quantity = position.quantity,
                    "Position adopted from broker snapshot"
                );
                self.mark_dirty(scope, false);
                Ok(())
            }
            Some(mut pos) => {
                let drifted = pos.quantity != update.quantity
                    || (update.avg_price > 0.0 && pos.entry_price != update.avg_price);
                if drifted {
                    warn!(
                        scope = %scope,
                        local_qty = pos.quantity,
                        broker_qty = update.quantity,
                        "Local position drifted from broker, reconciling"
                    );
                    pos.quantity = update.quantity;
                    pos.side = side;
                    if update.avg_price > 0.0 {
                        pos.entry_price = update.avg_price;
                    }
                    pos.last_update_time = Utc::now();
                    self.store.update_position(&pos)?;
                    self.mark_dirty(scope, false);
                }
                Ok(())
            }
        }
    }

    /// Fold a traded price into the open position's extremes. No event
    /// per tick; the scope is marked dirty and republished on the next
    /// flush.
    pub fn observe_price(&self, scope: &Scope, price: f64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.note_price(scope, price);
        if let Some(mut pos) = self.store.get_position(scope)? {
            let before = (pos.min_trade_price, pos.max_trade_price);
            pos.observe_price(price, at);
            if (pos.min_trade_price, pos.max_trade_price) != before {
                self.store.update_position(&pos)?;
            }
            self.mark_dirty(scope, false);
        }
        Ok(())
    }

    /// Attach or move protective prices on the open position. The stop
    /// feeds the R-multiple on close, so the first stop seen after entry
    /// defines the initial risk.
    pub fn set_protective_prices(
        &self,
        scope: &Scope,
        stop_price: Option<f64>,
        target_price: Option<f64>,
    ) -> Result<(), StoreError> {
        if let Some(mut pos) = self.store.get_position(scope)? {
            let mut changed = false;
            if stop_price.is_some() && pos.stop_price != stop_price {
                pos.stop_price = stop_price;
                changed = true;
            }
            if target_price.is_some() && pos.target_price != target_price {
                pos.target_price = target_price;
                changed = true;
            }
            if changed {
                pos.last_update_time = Utc::now();
                self.store.update_position(&pos)?;
                debug!(
                    scope = %scope,
                    stop = ?pos.stop_price,
                    target = ?pos.target_price,
                    "Protective prices updated"
                );
                self.mark_dirty(scope, false);
            }
        }
        Ok(())
    }

    /// Close the scope's position at the given price. Idempotent: a
    /// second close for the same scope is a no-op, so duplicate flat
    /// signals cannot double-book a trade.
    pub fn close(
        &self,
        scope: &Scope,
        exit_price: f64,
        exit_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let commission = match self.store.get_position(scope)? {
            Some(pos) if scope.mode == TradingMode::Sim => {
                self.accounts.commission_per_contract * pos.abs_quantity()
            }
            _ => 0.0,
        };
        let exit = ExitFill {
            price: exit_price,
            time: exit_time,
            point_value: self.accounts.point_value,
            commission,
        };

        match self.store.close_position(scope, &exit)? {
            CloseOutcome::Closed(trade) => {
                info!(
                    scope = %scope,
                    symbol = %trade.symbol,
                    realized_pnl = trade.realized_pnl,
                    mae = trade.mae,
                    mfe = trade.mfe,
                    "Position closed"
                );
                self.mark_dirty(scope, false);
                events::emit(&self.sink, CoreEvent::TradeClosed(trade));
            }
            CloseOutcome::AlreadyClosed => {
                debug!(scope = %scope, "Close requested for a flat scope, ignoring");
            }
        }
        Ok(())
    }

    /// Republish every persisted position after a restart or reconnect.
    /// Rows untouched longer than the staleness window are flagged for
    /// manual confirmation instead of being silently trusted.
    pub fn recover(&self) -> Result<Vec<OpenPosition>, StoreError> {
        let positions = self.store.list_positions()?;
        let now = Utc::now();
        for pos in &positions {
            let stale = now - pos.last_update_time > self.staleness;
            if stale {
                warn!(
                    scope = %pos.scope,
                    last_update = %pos.last_update_time,
                    "Recovered position exceeds staleness window, flagging"
                );
            } else {
                info!(scope = %pos.scope, symbol = %pos.symbol, "Recovered open position");
            }
            self.mark_dirty(&pos.scope, stale);
        }
        Ok(positions)
    }

    pub fn get(&self, scope: &Scope) -> Result<Option<OpenPosition>, StoreError> {
        self.store.get_position(scope)
    }

    /// Publish one event per scope touched since the last call. Driven
    /// by the supervisor's flush loop, so a burst of inbound messages
    /// collapses into a single notification per scope. A flat scope
    /// publishes `position: None`.
    pub fn flush_dirty(&self) -> Result<(), StoreError> {
        let touched: Vec<(Scope, bool)> = {
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            dirty.drain().collect()
        };
        for (scope, needs_confirmation) in touched {
            let position = self.store.get_position(&scope)?;
            events::emit(
                &self.sink,
                CoreEvent::PositionChanged {
                    scope,
                    position,
                    needs_confirmation,
                },
            );
        }
        Ok(())
    }

    fn open_from_fill(&self, scope: &Scope, fill: &FillEvent) -> Result<(), StoreError> {
        let symbol = fill.symbol.clone().unwrap_or_else(|| Symbol::new(""));
        let position = self.build_position(
            scope,
            symbol,
            fill.side,
            fill.quantity,
            fill.price,
            fill.timestamp,
        );
        self.store.open_position(&position)?;
        info!(
            scope = %scope,
            symbol = %position.symbol,
            side = ?position.side,
            quantity = position.quantity,
            entry_price = position.entry_price,
            "Position opened"
        );
        self.mark_dirty(scope, false);
        Ok(())
    }

    fn add_to_position(&self, mut pos: OpenPosition, fill: &FillEvent) -> Result<(), StoreError> {
        let old_qty = pos.abs_quantity();
        let new_qty = old_qty + fill.quantity;
        pos.entry_price = (pos.entry_price * old_qty + fill.price * fill.quantity) / new_qty;
        pos.quantity = pos.side.sign() * new_qty;
        pos.observe_price(fill.price, fill.timestamp);
        self.store.update_position(&pos)?;
        info!(
            scope = %pos.scope,
            quantity = pos.quantity,
            entry_price = pos.entry_price,
            "Added to position"
        );
        self.mark_dirty(&pos.scope, false);
        Ok(())
    }

    fn reduce_position(&self, mut pos: OpenPosition, fill: &FillEvent) -> Result<(), StoreError> {
        let new_qty = pos.abs_quantity() - fill.quantity;
        pos.quantity = pos.side.sign() * new_qty;
        pos.observe_price(fill.price, fill.timestamp);
        self.store.update_position(&pos)?;
        info!(scope = %pos.scope, quantity = pos.quantity, "Reduced position");
        self.mark_dirty(&pos.scope, false);
        Ok(())
    }

    fn build_position(
        &self,
        scope: &Scope,
        symbol: Symbol,
        side: Side,
        quantity: f64,
        entry_price: f64,
        entry_time: DateTime<Utc>,
    ) -> OpenPosition {
        OpenPosition::new(scope.clone(), symbol, side, quantity, entry_price, entry_time)
    }

    fn exit_price_hint(&self, scope: &Scope, update: &PositionUpdate) -> f64 {
        if update.avg_price > 0.0 {
            return update.avg_price;
        }
        let last = self
            .last_price
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(scope)
            .copied();
        match last {
            Some(p) => p,
            // No price ever observed for this scope; fall back to the
            // entry so the trade books at zero P&L rather than garbage.
            None => self
                .store
                .get_position(scope)
                .ok()
                .flatten()
                .map(|p| p.entry_price)
                .unwrap_or(0.0),
        }
    }

    fn note_price(&self, scope: &Scope, price: f64) {
        if price > 0.0 {
            self.last_price
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(scope.clone(), price);
        }
    }

    fn mark_dirty(&self, scope: &Scope, needs_confirmation: bool) {
        let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        let flag = dirty.entry(scope.clone()).or_insert(false);
        *flag = *flag || needs_confirmation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::store::MemoryStore;

    fn lifecycle() -> (Arc<MemoryStore>, PositionLifecycle, crate::events::EventStream) {
        let store = Arc::new(MemoryStore::new());
        let (sink, stream) = events::channel();
        let lc = PositionLifecycle::new(
            store.clone(),
            AccountsConfig::default(),
            &StoreConfig::default(),
            sink,
        );
        (store, lc, stream)
    }

    fn fill(side: Side, quantity: f64, price: f64) -> FillEvent {
        FillEvent {
            order_id: "42".to_string(),
            account: "Sim1".to_string(),
            symbol: Some(Symbol::new("ESZ5")),
            side,
            quantity,
            price,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_fill_opens_then_closes() {
        let (store, lc, _stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5800.0)).unwrap();
        let pos = store.get_position(&scope).unwrap().unwrap();
        assert_eq!(pos.quantity, 1.0);
        assert_eq!(pos.entry_price, 5800.0);

        lc.on_fill(&scope, &fill(Side::Sell, 1.0, 5810.0)).unwrap();
        assert!(store.get_position(&scope).unwrap().is_none());
        let trades = store.list_trades(None).unwrap();
        assert_eq!(trades.len(), 1);
        // 10 points * $50, less default SIM commission
        assert_eq!(trades[0].realized_pnl, 500.0 - 4.5);
    }

    #[test]
    fn test_adds_average_entry_price() {
        let (store, lc, _stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5800.0)).unwrap();
        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5810.0)).unwrap();

        let pos = store.get_position(&scope).unwrap().unwrap();
        assert_eq!(pos.quantity, 2.0);
        assert_eq!(pos.entry_price, 5805.0);
    }

    #[test]
    fn test_partial_reduce_books_no_trade() {
        let (store, lc, _stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 2.0, 5800.0)).unwrap();
        lc.on_fill(&scope, &fill(Side::Sell, 1.0, 5820.0)).unwrap();

        let pos = store.get_position(&scope).unwrap().unwrap();
        assert_eq!(pos.quantity, 1.0);
        assert!(store.list_trades(None).unwrap().is_empty());
    }

    #[test]
    fn test_reversal_closes_then_reopens() {
        let (store, lc, _stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5800.0)).unwrap();
        lc.on_fill(&scope, &fill(Side::Sell, 3.0, 5810.0)).unwrap();

        let pos = store.get_position(&scope).unwrap().unwrap();
        assert_eq!(pos.side, Side::Sell);
        assert_eq!(pos.quantity, -2.0);
        assert_eq!(store.list_trades(None).unwrap().len(), 1);
    }

    #[test]
    fn test_double_close_books_once() {
        let (store, lc, _stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5800.0)).unwrap();
        lc.close(&scope, 5810.0, Utc::now()).unwrap();
        lc.close(&scope, 5810.0, Utc::now()).unwrap();

        assert_eq!(store.list_trades(None).unwrap().len(), 1);
    }

    #[test]
    fn test_stop_enables_r_multiple() {
        let (store, lc, _stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5800.0)).unwrap();
        lc.set_protective_prices(&scope, Some(5790.0), None).unwrap();
        lc.close(&scope, 5820.0, Utc::now()).unwrap();

        let trades = store.list_trades(None).unwrap();
        // risk was 10 points, gross gain 20 points
        let r = trades[0].r_multiple.unwrap();
        assert!(r > 1.9 && r < 2.0, "r = {}", r);
    }

    #[test]
    fn test_flat_snapshot_closes_at_last_price() {
        let (store, lc, _stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5800.0)).unwrap();
        lc.observe_price(&scope, 5825.0, Utc::now()).unwrap();

        lc.apply_update(
            &scope,
            &PositionUpdate {
                account: "Sim1".to_string(),
                symbol: Symbol::new("ESZ5"),
                quantity: 0.0,
                avg_price: 0.0,
                update_reason: None,
            },
        )
        .unwrap();

        let trades = store.list_trades(None).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_price, 5825.0);
    }

    #[test]
    fn test_snapshot_adopts_unknown_position() {
        let (store, lc, mut stream) = lifecycle();
        let scope = Scope::live("120005");

        lc.apply_update(
            &scope,
            &PositionUpdate {
                account: "120005".to_string(),
                symbol: Symbol::new("NQZ5"),
                quantity: -2.0,
                avg_price: 20_100.0,
                update_reason: None,
            },
        )
        .unwrap();

        let pos = store.get_position(&scope).unwrap().unwrap();
        assert_eq!(pos.side, Side::Sell);
        assert_eq!(pos.quantity, -2.0);
        lc.flush_dirty().unwrap();
        assert!(matches!(
            stream.try_recv(),
            Ok(CoreEvent::PositionChanged { position: Some(_), .. })
        ));
    }

    #[test]
    fn test_recovery_flags_stale_rows() {
        let (store, _lc, _s) = lifecycle();
        let scope = Scope::sim("Sim1");
        let mut pos = OpenPosition::new(
            scope.clone(),
            Symbol::new("ESZ5"),
            Side::Buy,
            1.0,
            5800.0,
            Utc::now() - chrono::Duration::hours(48),
        );
        pos.last_update_time = Utc::now() - chrono::Duration::hours(48);
        store.open_position(&pos).unwrap();

        let (sink, mut stream) = events::channel();
        let lc = PositionLifecycle::new(
            store.clone(),
            AccountsConfig::default(),
            &StoreConfig::default(),
            sink,
        );
        lc.recover().unwrap();
        lc.flush_dirty().unwrap();

        match stream.try_recv() {
            Ok(CoreEvent::PositionChanged {
                needs_confirmation, ..
            }) => assert!(needs_confirmation),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_fill_burst_publishes_once_per_flush() {
        let (_store, lc, mut stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5800.0)).unwrap();
        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5810.0)).unwrap();
        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5820.0)).unwrap();
        // No publication per inbound fill
        assert!(stream.try_recv().is_err());

        lc.flush_dirty().unwrap();
        match stream.try_recv() {
            Ok(CoreEvent::PositionChanged {
                position: Some(p), ..
            }) => assert_eq!(p.quantity, 3.0),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn test_close_publishes_flat_on_flush() {
        let (_store, lc, mut stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5800.0)).unwrap();
        lc.on_fill(&scope, &fill(Side::Sell, 1.0, 5810.0)).unwrap();

        // The booked trade is a discrete event; the flat position waits
        // for the flush
        assert!(matches!(stream.try_recv(), Ok(CoreEvent::TradeClosed(_))));
        assert!(stream.try_recv().is_err());

        lc.flush_dirty().unwrap();
        match stream.try_recv() {
            Ok(CoreEvent::PositionChanged { position: None, .. }) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_price_ticks_coalesce_into_flush() {
        let (_store, lc, mut stream) = lifecycle();
        let scope = Scope::sim("Sim1");

        lc.on_fill(&scope, &fill(Side::Buy, 1.0, 5800.0)).unwrap();

        lc.observe_price(&scope, 5790.0, Utc::now()).unwrap();
        lc.observe_price(&scope, 5795.0, Utc::now()).unwrap();
        lc.observe_price(&scope, 5820.0, Utc::now()).unwrap();
        assert!(stream.try_recv().is_err());

        lc.flush_dirty().unwrap();
        match stream.try_recv() {
            Ok(CoreEvent::PositionChanged {
                position: Some(p), ..
            }) => {
                assert_eq!(p.min_trade_price, 5790.0);
                assert_eq!(p.max_trade_price, 5820.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(stream.try_recv().is_err());
    }
}
