//! Integration tests for the DTC bridge
//!
//! These drive the wire-facing pipeline (normalizer -> router ->
//! lifecycle -> store -> events) the way a session would, without a
//! gateway.

use chrono::Utc;
use std::sync::Arc;

use dtc_bridge::common::{CircuitBreaker, CircuitBreakerConfig};
use dtc_bridge::config::{AccountsConfig, ResilienceConfig, RouterConfig, StoreConfig};
use dtc_bridge::dtc::normalizer::normalize;
use dtc_bridge::events::{self, CoreEvent, EventStream};
use dtc_bridge::store::{sqlite::SqliteStore, CloseOutcome, MemoryStore, TradeStore};
use dtc_bridge::types::{Scope, Side, TradingMode};
use dtc_bridge::{BalanceLedger, PositionLifecycle, RecoveryCoordinator, Router};

// =============================================================================
// Test Utilities
// =============================================================================

fn accounts() -> AccountsConfig {
    AccountsConfig {
        live_account: Some("120005".to_string()),
        ..AccountsConfig::default()
    }
}

struct Harness {
    router: Router,
    store: Arc<dyn TradeStore>,
    lifecycle: Arc<PositionLifecycle>,
    balance: Arc<BalanceLedger>,
    stream: EventStream,
}

fn harness_with(store: Arc<dyn TradeStore>) -> Harness {
    let (sink, stream) = events::channel();
    let lifecycle = Arc::new(PositionLifecycle::new(
        store.clone(),
        accounts(),
        &StoreConfig::default(),
        sink.clone(),
    ));
    let balance = Arc::new(BalanceLedger::new(store.clone(), accounts(), sink.clone()));
    let recovery = Arc::new(RecoveryCoordinator::new(
        store.clone(),
        ResilienceConfig::default(),
        StoreConfig::default(),
        sink.clone(),
    ));
    let router = Router::new(
        accounts(),
        &RouterConfig::default(),
        lifecycle.clone(),
        balance.clone(),
        recovery,
        store.clone(),
        sink,
    );
    Harness {
        router,
        store,
        lifecycle,
        balance,
        stream,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()))
}

/// Wire-shaped order update with a fill attached
fn wire_fill(order_id: &str, account: &str, side: i64, qty: f64, price: f64) -> serde_json::Value {
    serde_json::json!({
        "Type": 301,
        "ServerOrderID": order_id,
        "TradeAccount": account,
        "Symbol": "ESZ5",
        "BuySell": side,
        "OrderStatus": 7,
        "OrderQuantity": qty,
        "FilledQuantity": qty,
        "LastFillPrice": price,
        "LastFillQuantity": qty,
        "LastFillDateTime": Utc::now().timestamp(),
    })
}

fn feed(harness: &Harness, raw: &serde_json::Value) {
    let msg = normalize(raw).expect("message should normalize");
    harness.router.handle(&msg);
}

/// Publish coalesced notifications, as the supervisor's flush tick does
fn flush(harness: &Harness) {
    harness.lifecycle.flush_dirty().unwrap();
    harness.balance.flush_dirty();
}

fn drain(stream: &mut EventStream) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = stream.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Fill pipeline
// =============================================================================

#[test]
fn test_net_zero_fill_sequence_books_exactly_one_trade() {
    let mut h = harness();

    feed(&h, &wire_fill("1", "Sim1", 1, 2.0, 5800.0));
    feed(&h, &wire_fill("2", "Sim1", 2, 1.0, 5810.0));
    feed(&h, &wire_fill("3", "Sim1", 2, 1.0, 5820.0));

    assert!(h.store.get_position(&Scope::sim("Sim1")).unwrap().is_none());
    let trades = h.store.list_trades(None).unwrap();
    assert_eq!(trades.len(), 1);

    let closed_events = drain(&mut h.stream)
        .into_iter()
        .filter(|e| matches!(e, CoreEvent::TradeClosed(_)))
        .count();
    assert_eq!(closed_events, 1);
}

#[test]
fn test_duplicate_fill_message_is_idempotent() {
    let h = harness();

    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));
    // Same terminal order replayed; the ledger freezes terminal entries
    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));

    let pos = h.store.get_position(&Scope::sim("Sim1")).unwrap().unwrap();
    assert_eq!(pos.quantity, 1.0);
}

#[test]
fn test_inbound_burst_coalesces_presentation_events() {
    let mut h = harness();

    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));
    feed(&h, &wire_fill("2", "Sim1", 1, 1.0, 5810.0));
    feed(&h, &wire_fill("3", "Sim1", 1, 1.0, 5820.0));

    // No presentation event per inbound message
    let immediate = drain(&mut h.stream);
    assert!(immediate.iter().all(|e| !matches!(
        e,
        CoreEvent::PositionChanged { .. } | CoreEvent::BalanceChanged { .. }
    )));

    // One position event for the scope on the next flush tick
    flush(&h);
    let positions = drain(&mut h.stream)
        .into_iter()
        .filter(|e| matches!(e, CoreEvent::PositionChanged { .. }))
        .count();
    assert_eq!(positions, 1);
}

#[test]
fn test_mae_mfe_captured_across_ticks() {
    let h = harness();
    let scope = Scope::sim("Sim1");

    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));

    // Adverse tick to 5790, favorable to 5820, exit at 5850
    let lifecycle = PositionLifecycle::new(
        h.store.clone(),
        accounts(),
        &StoreConfig::default(),
        events::channel().0,
    );
    lifecycle.observe_price(&scope, 5790.0, Utc::now()).unwrap();
    lifecycle.observe_price(&scope, 5820.0, Utc::now()).unwrap();

    feed(&h, &wire_fill("2", "Sim1", 2, 1.0, 5850.0));

    let trades = h.store.list_trades(None).unwrap();
    assert_eq!(trades.len(), 1);
    let t = &trades[0];
    // 10 adverse points and 50 favorable points at $50/pt
    assert_eq!(t.mae, 500.0);
    assert_eq!(t.mfe, 2500.0);
    assert_eq!(t.realized_pnl, 2500.0 - accounts().commission_per_contract);
}

// =============================================================================
// Balance identity
// =============================================================================

#[test]
fn test_sim_balance_is_starting_plus_realized() {
    let mut h = harness();

    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));
    feed(&h, &wire_fill("2", "Sim1", 2, 1.0, 5810.0));

    let expected =
        accounts().sim_starting_balance + 500.0 - accounts().commission_per_contract;
    flush(&h);
    let last_balance = drain(&mut h.stream)
        .into_iter()
        .filter_map(|e| match e {
            CoreEvent::BalanceChanged { scope, balance } if scope == Scope::sim("Sim1") => {
                Some(balance.balance)
            }
            _ => None,
        })
        .last()
        .expect("SIM balance should have been published");
    assert_eq!(last_balance, expected);
}

#[test]
fn test_sim_and_live_balances_are_independent() {
    let mut h = harness();

    // SIM round trip
    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));
    feed(&h, &wire_fill("2", "Sim1", 2, 1.0, 5810.0));

    // Broker-reported LIVE balance
    feed(
        &h,
        &serde_json::json!({
            "Type": 600,
            "TradeAccount": "120005",
            "CashBalance": 52_000.0,
            "OpenPositionsProfitLoss": 0.0,
            "DailyProfitLoss": 0.0,
        }),
    );

    flush(&h);
    let balances: Vec<(Scope, f64)> = drain(&mut h.stream)
        .into_iter()
        .filter_map(|e| match e {
            CoreEvent::BalanceChanged { scope, balance } => Some((scope, balance.balance)),
            _ => None,
        })
        .collect();

    let sim = balances
        .iter()
        .filter(|(s, _)| s.mode == TradingMode::Sim)
        .last()
        .unwrap();
    let live = balances
        .iter()
        .filter(|(s, _)| s.mode == TradingMode::Live)
        .last()
        .unwrap();
    assert_eq!(
        sim.1,
        accounts().sim_starting_balance + 500.0 - accounts().commission_per_contract
    );
    assert_eq!(live.1, 52_000.0);
}

#[test]
fn test_wire_balance_never_overwrites_sim_ledger() {
    let mut h = harness();

    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));
    feed(&h, &wire_fill("2", "Sim1", 2, 1.0, 5810.0));
    flush(&h);
    drain(&mut h.stream);

    // Gateway resets its simulated balance; the derived figure must hold
    feed(
        &h,
        &serde_json::json!({
            "Type": 600,
            "TradeAccount": "Sim1",
            "CashBalance": 0.0,
        }),
    );

    flush(&h);
    let balances: Vec<f64> = drain(&mut h.stream)
        .into_iter()
        .filter_map(|e| match e {
            CoreEvent::BalanceChanged { balance, .. } => Some(balance.balance),
            _ => None,
        })
        .collect();
    for b in balances {
        assert_ne!(b, 0.0);
    }
}

// =============================================================================
// Mode debounce and drift
// =============================================================================

#[test]
fn test_single_stray_message_does_not_flip_mode() {
    let h = harness();

    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));
    feed(&h, &wire_fill("2", "Sim1", 2, 1.0, 5810.0));
    assert_eq!(h.router.active_scope(), Scope::sim("Sim1"));

    feed(&h, &wire_fill("3", "120005", 1, 1.0, 20_000.0));
    assert_eq!(h.router.active_scope(), Scope::sim("Sim1"));
}

#[test]
fn test_confirmed_drift_disarms_live_gate() {
    let mut h = harness();

    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));
    feed(&h, &wire_fill("2", "Sim1", 2, 1.0, 5810.0));
    drain(&mut h.stream);

    feed(&h, &wire_fill("3", "120005", 1, 1.0, 20_000.0));
    feed(&h, &wire_fill("4", "120005", 2, 1.0, 20_010.0));
    assert_eq!(h.router.active_scope(), Scope::live("120005"));

    let disarmed = drain(&mut h.stream)
        .into_iter()
        .any(|e| matches!(e, CoreEvent::LiveGateDisarmed { .. }));
    assert!(disarmed);
}

// =============================================================================
// Durable state across restart
// =============================================================================

#[test]
fn test_open_position_survives_restart_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");

    let before = {
        let store: Arc<dyn TradeStore> =
            Arc::new(SqliteStore::open(&path).unwrap());
        let h = harness_with(store);
        feed(&h, &wire_fill("1", "Sim1", 1, 2.0, 5800.0));
        h.store.get_position(&Scope::sim("Sim1")).unwrap().unwrap()
    };

    // Fresh store handle over the same file, as after a process restart
    let store = SqliteStore::open(&path).unwrap();
    let after = store.get_position(&Scope::sim("Sim1")).unwrap().unwrap();

    assert_eq!(after, before);
}

#[test]
fn test_double_close_on_disk_books_one_trade() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");
    let store = SqliteStore::open(&path).unwrap();
    let h = harness_with(Arc::new(store));
    let scope = Scope::sim("Sim1");

    feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));

    let exit = dtc_bridge::position::metrics::ExitFill {
        price: 5810.0,
        time: Utc::now(),
        point_value: 50.0,
        commission: 0.0,
    };
    assert!(matches!(
        h.store.close_position(&scope, &exit).unwrap(),
        CloseOutcome::Closed(_)
    ));
    assert_eq!(
        h.store.close_position(&scope, &exit).unwrap(),
        CloseOutcome::AlreadyClosed
    );
    assert_eq!(h.store.list_trades(None).unwrap().len(), 1);
}

#[test]
fn test_recovery_pull_anchor_comes_from_persisted_fills() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");

    {
        let store: Arc<dyn TradeStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let h = harness_with(store);
        feed(&h, &wire_fill("1", "Sim1", 1, 1.0, 5800.0));
    }

    let store = SqliteStore::open(&path).unwrap();
    let anchor = store.last_recorded_fill_ts().unwrap();
    assert!(anchor.is_some());
    assert!(Utc::now() - anchor.unwrap() < chrono::Duration::minutes(1));
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[test]
fn test_breaker_fails_fast_then_allows_single_trial() {
    let mut breaker = CircuitBreaker::new(
        CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_recovery_timeout(std::time::Duration::from_millis(20)),
    );

    for _ in 0..3 {
        assert!(breaker.can_attempt());
        breaker.record_failure();
    }
    // Open: attempts rejected without touching the network
    assert!(!breaker.can_attempt());

    std::thread::sleep(std::time::Duration::from_millis(30));
    // One trial allowed, a second is not while the trial is outstanding
    assert!(breaker.can_attempt());
    assert!(!breaker.can_attempt());

    breaker.record_success();
    assert!(breaker.can_attempt());
}

// =============================================================================
// Normalizer
// =============================================================================

#[test]
fn test_fill_price_alias_priority_end_to_end() {
    let h = harness();

    // Both LastFillPrice and Price1 present; LastFillPrice must win
    feed(
        &h,
        &serde_json::json!({
            "Type": 301,
            "ServerOrderID": "9",
            "TradeAccount": "Sim1",
            "Symbol": "ESZ5",
            "BuySell": 1,
            "OrderStatus": 7,
            "OrderQuantity": 1.0,
            "FilledQuantity": 1.0,
            "LastFillPrice": 5801.25,
            "Price1": 9999.0,
            "LastFillQuantity": 1.0,
        }),
    );

    let pos = h.store.get_position(&Scope::sim("Sim1")).unwrap().unwrap();
    assert_eq!(pos.entry_price, 5801.25);
}

#[test]
fn test_short_round_trip_signs() {
    let h = harness();

    feed(&h, &wire_fill("1", "Sim1", 2, 1.0, 5800.0));
    let pos = h.store.get_position(&Scope::sim("Sim1")).unwrap().unwrap();
    assert_eq!(pos.side, Side::Sell);
    assert_eq!(pos.quantity, -1.0);

    feed(&h, &wire_fill("2", "Sim1", 1, 1.0, 5790.0));
    let trades = h.store.list_trades(None).unwrap();
    assert_eq!(trades.len(), 1);
    // Short 10 points at $50/pt, less commission
    assert_eq!(
        trades[0].realized_pnl,
        500.0 - accounts().commission_per_contract
    );
}
