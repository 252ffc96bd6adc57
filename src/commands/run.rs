//! Bridge supervisor
//!
//! Owns the connect/consume/reconnect loop. Connection attempts go
//! through the circuit breaker, reconnect delays through exponential
//! backoff, and every session starts with a recovery pull before live
//! traffic is trusted. Ctrl+C sends a clean logoff.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use dtc_bridge::common::{Backoff, BackoffConfig, CircuitBreaker, CircuitBreakerConfig};
use dtc_bridge::config::Config;
use dtc_bridge::dtc::connection::{self, ConnectionEvent};
use dtc_bridge::dtc::messages::Request;
use dtc_bridge::events::{self, CoreEvent, HealthState};
use dtc_bridge::store::{open_store, TradeStore};
use dtc_bridge::{BalanceLedger, PositionLifecycle, RecoveryCoordinator, Router};

pub fn run(config_path: String, state_db: Option<String>) -> Result<()> {
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, state_db))
}

async fn run_async(config_path: String, state_db: Option<String>) -> Result<()> {
    let mut config = Config::from_file(&config_path)
        .context(format!("Failed to load config from {}", config_path))?;
    if let Some(path) = state_db {
        config.store.primary_path = path;
    }

    info!("DTC bridge starting");
    info!("Gateway: {}", config.gateway.addr());
    info!("SIM prefix: {}", config.accounts.sim_prefix);
    match &config.accounts.live_account {
        Some(account) => info!("LIVE account: {}", account),
        None => info!("LIVE account: none configured"),
    }

    let store: Arc<dyn TradeStore> = open_store(&config.store);

    let (sink, mut stream) = events::channel();
    let lifecycle = Arc::new(PositionLifecycle::new(
        store.clone(),
        config.accounts.clone(),
        &config.store,
        sink.clone(),
    ));
    let balance = Arc::new(BalanceLedger::new(
        store.clone(),
        config.accounts.clone(),
        sink.clone(),
    ));
    let recovery = Arc::new(RecoveryCoordinator::new(
        store.clone(),
        config.resilience.clone(),
        config.store.clone(),
        sink.clone(),
    ));
    let router = Arc::new(Router::new(
        config.accounts.clone(),
        &config.router,
        lifecycle.clone(),
        balance.clone(),
        recovery.clone(),
        store.clone(),
        sink.clone(),
    ));

    // Provisional mode: the freshest persisted position names the scope
    // that was active before the restart, trusted only inside its TTL.
    match store.list_positions() {
        Ok(positions) => {
            if let Some(p) = positions.iter().max_by_key(|p| p.last_update_time) {
                router.seed_last_known(p.scope.clone(), p.last_update_time);
            }
        }
        Err(e) => warn!(error = %e, "Could not read persisted positions for mode seeding"),
    }

    // Presentation pump: renders core events to the log until a real
    // frontend subscribes in its place.
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            render_event(&event);
        }
    });

    // Coalesced publication of position and balance changes
    let flush_lifecycle = lifecycle.clone();
    let flush_balance = balance.clone();
    let flush_every = config.router.flush_interval();
    tokio::spawn(async move {
        let mut ticker = interval(flush_every);
        loop {
            ticker.tick().await;
            if let Err(e) = flush_lifecycle.flush_dirty() {
                warn!(error = %e, "Position flush failed");
            }
            flush_balance.flush_dirty();
        }
    });

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                shutdown_flag_clone.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut breaker = CircuitBreaker::new(
        CircuitBreakerConfig::default()
            .with_failure_threshold(config.resilience.failure_threshold)
            .with_recovery_timeout(config.resilience.recovery_timeout()),
    );
    let mut backoff = Backoff::new(
        BackoffConfig::default()
            .with_base(Duration::from_secs(config.resilience.backoff_base_secs))
            .with_cap(Duration::from_secs(config.resilience.backoff_cap_secs)),
    );

    info!("Starting supervisor loop");

    'supervisor: while !shutdown_flag.load(Ordering::SeqCst) {
        if !breaker.can_attempt() {
            events::emit(
                &sink,
                CoreEvent::ConnectionHealth {
                    state: HealthState::Down,
                    stats: breaker.stats(),
                },
            );
            tokio::select! {
                _ = sleep(Duration::from_secs(1)) => continue,
                _ = shutdown_rx.recv() => break 'supervisor,
            }
        }

        events::emit(
            &sink,
            CoreEvent::ConnectionHealth {
                state: HealthState::Reconnecting,
                stats: breaker.stats(),
            },
        );

        let (session, mut inbound) = match connection::connect(&config.gateway).await {
            Ok(pair) => pair,
            Err(e) => {
                breaker.record_failure();
                warn!(error = %e, attempts = backoff.attempts(), "Connection attempt failed");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = sleep(delay) => continue,
                    _ = shutdown_rx.recv() => break 'supervisor,
                }
            }
        };

        breaker.record_success();
        backoff.reset();
        events::emit(
            &sink,
            CoreEvent::ConnectionHealth {
                state: HealthState::Connected,
                stats: breaker.stats(),
            },
        );

        // Persisted picture first, then ask the gateway for its version
        if let Err(e) = lifecycle.recover() {
            warn!(error = %e, "Position recovery failed");
        }
        if let Err(e) = session
            .send(&Request::TradeAccounts {
                request_id: session.next_request_id(),
            })
            .await
        {
            warn!(error = %e, "Trade accounts request failed");
        }
        for account in pull_accounts(&config, &router) {
            if let Err(e) = recovery.begin(&session, &account, breaker.stats()).await {
                warn!(account = %account, error = %e, "Recovery pull request failed");
            }
        }

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(ConnectionEvent::Message(msg)) => {
                        router.handle(&msg);
                    }
                    Some(ConnectionEvent::Lost(e)) => {
                        warn!(error = %e, "Session lost");
                        break;
                    }
                    None => {
                        debug!("Inbound channel closed");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => {
                    let _ = session
                        .send(&Request::Logoff {
                            reason: "client shutdown".to_string(),
                        })
                        .await;
                    break 'supervisor;
                }
            }
        }

        recovery.settle();
        breaker.record_failure();
        events::emit(
            &sink,
            CoreEvent::ConnectionHealth {
                state: HealthState::Reconnecting,
                stats: breaker.stats(),
            },
        );
        let delay = backoff.next_delay();
        info!(delay_secs = delay.as_secs(), "Reconnecting after delay");
        tokio::select! {
            _ = sleep(delay) => {},
            _ = shutdown_rx.recv() => break 'supervisor,
        }
    }

    info!("Bridge stopped");
    Ok(())
}

/// Accounts worth pulling on session start: the configured LIVE account
/// plus whatever scope was last active
fn pull_accounts(config: &Config, router: &Router) -> Vec<String> {
    let mut accounts = Vec::new();
    if let Some(live) = &config.accounts.live_account {
        accounts.push(live.clone());
    }
    let active = router.active_scope();
    if active.is_known() && !accounts.contains(&active.account) {
        accounts.push(active.account);
    }
    accounts
}

fn render_event(event: &CoreEvent) {
    match event {
        CoreEvent::PositionChanged {
            scope,
            position,
            needs_confirmation,
        } => match position {
            Some(p) => info!(
                scope = %scope,
                symbol = %p.symbol,
                side = %p.side,
                quantity = p.quantity,
                entry = p.entry_price,
                needs_confirmation,
                "POSITION"
            ),
            None => info!(scope = %scope, "POSITION flat"),
        },
        CoreEvent::TradeClosed(trade) => info!(
            scope = %trade.scope,
            symbol = %trade.symbol,
            pnl = trade.realized_pnl,
            mae = trade.mae,
            mfe = trade.mfe,
            efficiency = trade.efficiency,
            "TRADE CLOSED"
        ),
        CoreEvent::BalanceChanged { scope, balance } => info!(
            scope = %scope,
            balance = balance.balance,
            open_pnl = balance.open_pnl,
            daily_pnl = balance.daily_pnl,
            "BALANCE"
        ),
        CoreEvent::ModeChanged(scope) => info!(scope = %scope, "MODE"),
        CoreEvent::ConnectionHealth { state, stats } => info!(
            health = %state,
            breaker = %stats.state,
            failures = stats.consecutive_failures,
            "HEALTH"
        ),
        CoreEvent::LiveGateDisarmed { reason } => {
            warn!(reason = %reason, "LIVE GATE DISARMED")
        }
    }
}
