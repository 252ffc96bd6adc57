//! Order ledger builder
//!
//! Folds a stream of partial `OrderUpdate`s per order id into a terminal
//! snapshot, and appends every execution to a chronological fill stream
//! used for MAE/MFE reconstruction and audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::dtc::messages::OrderUpdate;
use crate::types::{OrderKind, OrderStatus, Side, Symbol};

/// Terminal view of one order id, built incrementally.
///
/// Fields resolve to the best available value: a later update only
/// overwrites a field when it actually carries it. Once the status is
/// terminal the entry is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLedgerEntry {
    pub order_id: String,
    pub account: String,
    pub symbol: Option<Symbol>,
    pub side: Option<Side>,
    pub kind: Option<OrderKind>,
    pub status: OrderStatus,
    pub reason: Option<String>,
    pub quantity: Option<f64>,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub text: Option<String>,
}

impl OrderLedgerEntry {
    fn new(update: &OrderUpdate, at: DateTime<Utc>) -> Self {
        OrderLedgerEntry {
            order_id: update.order_id.clone(),
            account: update.account.clone(),
            symbol: None,
            side: None,
            kind: None,
            status: OrderStatus::Unspecified,
            reason: None,
            quantity: None,
            filled_quantity: 0.0,
            avg_fill_price: None,
            first_seen: at,
            last_seen: at,
            text: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock lifetime of the order so far
    pub fn duration(&self) -> chrono::Duration {
        self.last_seen - self.first_seen
    }
}

/// One execution record, append-only, ordered by arrival
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub account: String,
    pub symbol: Option<Symbol>,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// What folding one update produced
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOutcome {
    /// Entry changed, no new execution
    Updated,
    /// Entry changed and a fill was appended
    Filled(FillEvent),
    /// Update arrived for an already-terminal entry; ignored
    Frozen,
    /// Update carried nothing usable
    Skipped,
}

/// Folds order updates by id; retains terminal entries read-only
#[derive(Debug, Default)]
pub struct OrderLedgerBuilder {
    entries: HashMap<String, OrderLedgerEntry>,
    fills: Vec<FillEvent>,
}

impl OrderLedgerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one update into the ledger
    pub fn apply(&mut self, update: &OrderUpdate) -> LedgerOutcome {
        if update.order_id.is_empty() {
            return LedgerOutcome::Skipped;
        }
        let at = update.timestamp.unwrap_or_else(Utc::now);

        let entry = self
            .entries
            .entry(update.order_id.clone())
            .or_insert_with(|| OrderLedgerEntry::new(update, at));

        if entry.is_terminal() {
            debug!("Update for terminal order {} ignored", update.order_id);
            return LedgerOutcome::Frozen;
        }

        entry.last_seen = at;
        if !update.account.is_empty() {
            entry.account = update.account.clone();
        }
        merge(&mut entry.symbol, update.symbol.clone());
        merge(&mut entry.side, update.side);
        merge(&mut entry.kind, update.kind);
        merge(&mut entry.reason, update.reason.clone());
        merge(&mut entry.quantity, update.order_quantity);
        merge(&mut entry.avg_fill_price, update.avg_fill_price);
        merge(&mut entry.text, update.text.clone());
        if let Some(status) = update.status {
            entry.status = status;
        }

        // A fill-bearing update grows the cumulative fill and appends to
        // the execution stream
        let fill = fill_from_update(entry, update, at);
        if let Some(filled) = update.filled_quantity {
            entry.filled_quantity = entry.filled_quantity.max(filled);
        } else if let Some(f) = &fill {
            entry.filled_quantity += f.quantity;
        }

        match fill {
            Some(f) => {
                self.fills.push(f.clone());
                LedgerOutcome::Filled(f)
            }
            None => LedgerOutcome::Updated,
        }
    }

    pub fn get(&self, order_id: &str) -> Option<&OrderLedgerEntry> {
        self.entries.get(order_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &OrderLedgerEntry> {
        self.entries.values()
    }

    /// Chronological, append-only execution stream
    pub fn fills(&self) -> &[FillEvent] {
        &self.fills
    }

    /// Most recent fill timestamp, the since-anchor for the recovery pull
    pub fn last_fill_ts(&self) -> Option<DateTime<Utc>> {
        self.fills.iter().map(|f| f.timestamp).max()
    }

    /// Signed net quantity executed for an account (buys minus sells)
    pub fn net_filled_quantity(&self, account: &str) -> f64 {
        self.fills
            .iter()
            .filter(|f| f.account == account)
            .map(|f| f.side.sign() * f.quantity)
            .sum()
    }

    pub fn open_order_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_terminal()).count()
    }
}

fn merge<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

fn fill_from_update(
    entry: &OrderLedgerEntry,
    update: &OrderUpdate,
    at: DateTime<Utc>,
) -> Option<FillEvent> {
    let price = update.last_fill_price?;
    let quantity = update.last_fill_quantity?;
    if quantity <= 0.0 {
        return None;
    }
    let side = update.side.or(entry.side)?;
    Some(FillEvent {
        order_id: update.order_id.clone(),
        account: if update.account.is_empty() {
            entry.account.clone()
        } else {
            update.account.clone()
        },
        symbol: update.symbol.clone().or_else(|| entry.symbol.clone()),
        side,
        quantity,
        price,
        timestamp: at,
    })
}
