//! Read-only reporting against the persisted store

use anyhow::{Context, Result};
use std::collections::BTreeSet;

use dtc_bridge::config::Config;
use dtc_bridge::store::open_store;
use dtc_bridge::types::{Scope, TradingMode};

/// Print closed trades, optionally filtered to one account
pub fn trades(config_path: String, account: Option<String>) -> Result<()> {
    let config = Config::from_file(&config_path)
        .context(format!("Failed to load config from {}", config_path))?;
    let store = open_store(&config.store);

    let mut trades = store.list_trades(None)?;
    if let Some(account) = &account {
        trades.retain(|t| &t.scope.account == account);
    }
    trades.sort_by_key(|t| t.exit_time);

    if trades.is_empty() {
        println!("No closed trades recorded.");
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<5} {:>5} {:>10} {:>10} {:>10} {:>8} {:>8} {:>6}",
        "Scope", "Symbol", "Side", "Qty", "Entry", "Exit", "P&L", "MAE", "MFE", "Eff"
    );
    let mut total = 0.0;
    for t in &trades {
        println!(
            "{:<12} {:<10} {:<5} {:>5.0} {:>10.2} {:>10.2} {:>10.2} {:>8.2} {:>8.2} {:>6.2}",
            t.scope.to_string(),
            t.symbol,
            t.side,
            t.quantity.abs(),
            t.entry_price,
            t.exit_price,
            t.realized_pnl,
            t.mae,
            t.mfe,
            t.efficiency,
        );
        total += t.realized_pnl;
    }
    println!("\n{} trades, net P&L {:.2}", trades.len(), total);
    Ok(())
}

/// Print open positions
pub fn positions(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .context(format!("Failed to load config from {}", config_path))?;
    let store = open_store(&config.store);

    let positions = store.list_positions()?;
    if positions.is_empty() {
        println!("No open positions.");
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<5} {:>5} {:>10} {:>10} {:>10} {:<20}",
        "Scope", "Symbol", "Side", "Qty", "Entry", "Low", "High", "Opened"
    );
    for p in &positions {
        println!(
            "{:<12} {:<10} {:<5} {:>5.0} {:>10.2} {:>10.2} {:>10.2} {:<20}",
            p.scope.to_string(),
            p.symbol,
            p.side,
            p.abs_quantity(),
            p.entry_price,
            p.min_trade_price,
            p.max_trade_price,
            p.entry_time.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

/// Print per-scope balances. SIM figures are derived from the trade
/// ledger; LIVE figures come from the latest broker snapshot and are
/// only available while the bridge is running, so this shows the
/// derived SIM side.
pub fn balance(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .context(format!("Failed to load config from {}", config_path))?;
    let store = open_store(&config.store);

    let mut scopes: BTreeSet<(String, String)> = BTreeSet::new();
    for t in store.list_trades(None)? {
        scopes.insert((t.scope.mode.as_str().to_string(), t.scope.account.clone()));
    }
    for p in store.list_positions()? {
        scopes.insert((p.scope.mode.as_str().to_string(), p.scope.account.clone()));
    }

    if scopes.is_empty() {
        println!("No trading activity recorded.");
        return Ok(());
    }

    println!("{:<12} {:>14}", "Scope", "Balance");
    for (mode, account) in scopes {
        let scope = Scope::new(TradingMode::parse(&mode), account);
        match scope.mode {
            TradingMode::Sim => {
                let realized = store.realized_pnl_sum(&scope)?;
                println!(
                    "{:<12} {:>14.2}",
                    scope.to_string(),
                    config.accounts.sim_starting_balance + realized
                );
            }
            _ => {
                println!("{:<12} {:>14}", scope.to_string(), "broker-reported");
            }
        }
    }
    Ok(())
}
