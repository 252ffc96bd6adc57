//! Core data types used across the bridge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Instrument symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Sign applied to a quantity held on this side
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Trading mode: SIM accounts and the LIVE account are isolated contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradingMode {
    Sim,
    Live,
    Unknown,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Sim => write!(f, "SIM"),
            TradingMode::Live => write!(f, "LIVE"),
            TradingMode::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Sim => "SIM",
            TradingMode::Live => "LIVE",
            TradingMode::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> TradingMode {
        match s {
            "SIM" => TradingMode::Sim,
            "LIVE" => TradingMode::Live,
            _ => TradingMode::Unknown,
        }
    }
}

/// A (mode, account) pair: the key under which positions, trades, and
/// balances are isolated from each other
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub mode: TradingMode,
    pub account: String,
}

impl Scope {
    pub fn new(mode: TradingMode, account: impl Into<String>) -> Self {
        Scope {
            mode,
            account: account.into(),
        }
    }

    pub fn sim(account: impl Into<String>) -> Self {
        Scope::new(TradingMode::Sim, account)
    }

    pub fn live(account: impl Into<String>) -> Self {
        Scope::new(TradingMode::Live, account)
    }

    pub fn unknown() -> Self {
        Scope::new(TradingMode::Unknown, "")
    }

    pub fn is_known(&self) -> bool {
        self.mode != TradingMode::Unknown && !self.account.is_empty()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.mode, self.account)
    }
}

/// Order status as reconstructed from the update stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Unspecified,
    Submitted,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses freeze the ledger entry
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// Order type as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
    Unknown,
}

/// Market conditions captured when a position is opened, kept on the row
/// so closed trades can be reviewed against their entry context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub session_high: Option<f64>,
    pub session_low: Option<f64>,
}

/// One open position; at most one row exists per scope, enforced by the
/// store's uniqueness constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub scope: Scope,
    pub symbol: Symbol,
    /// Signed: positive long, negative short
    pub quantity: f64,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    /// Running extremes of traded price while the position was open,
    /// feeding MAE/MFE on close
    pub min_trade_price: f64,
    pub max_trade_price: f64,
    pub entry_context: MarketContext,
    pub last_update_time: DateTime<Utc>,
}

impl OpenPosition {
    pub fn new(
        scope: Scope,
        symbol: Symbol,
        side: Side,
        quantity: f64,
        entry_price: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        OpenPosition {
            scope,
            symbol,
            quantity: side.sign() * quantity.abs(),
            side,
            entry_price,
            entry_time,
            stop_price: None,
            target_price: None,
            min_trade_price: entry_price,
            max_trade_price: entry_price,
            entry_context: MarketContext::default(),
            last_update_time: entry_time,
        }
    }

    pub fn abs_quantity(&self) -> f64 {
        self.quantity.abs()
    }

    /// Fold a traded price into the running extremes
    pub fn observe_price(&mut self, price: f64, at: DateTime<Utc>) {
        if price < self.min_trade_price {
            self.min_trade_price = price;
        }
        if price > self.max_trade_price {
            self.max_trade_price = price;
        }
        self.last_update_time = at;
    }
}

/// Immutable record of a completed round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub scope: Scope,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub realized_pnl: f64,
    pub commission: f64,
    /// Maximum adverse excursion, in dollars
    pub mae: f64,
    /// Maximum favorable excursion, in dollars
    pub mfe: f64,
    /// realized_pnl / MFE; 0 when MFE is 0
    pub efficiency: f64,
    /// realized_pnl / initial risk; only when a stop was set at entry
    pub r_multiple: Option<f64>,
    pub entry_context: MarketContext,
}

/// Per-scope balance; SIM is ledger-derived, LIVE is broker-reported
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub balance: f64,
    pub open_pnl: f64,
    pub daily_pnl: f64,
    pub as_of: DateTime<Utc>,
}
