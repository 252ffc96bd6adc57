//! DTC wire message set
//!
//! The gateway speaks the JSON compact encoding: one object per frame,
//! discriminated by a numeric `Type` field. Only the account, order,
//! position, balance, and session subset is modeled; everything else is
//! skipped by the normalizer.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OrderKind, OrderStatus, Side, Symbol};

/// DTC message type numbers
pub mod type_ids {
    pub const LOGON_REQUEST: i64 = 1;
    pub const LOGON_RESPONSE: i64 = 2;
    pub const HEARTBEAT: i64 = 3;
    pub const LOGOFF: i64 = 5;

    pub const OPEN_ORDERS_REQUEST: i64 = 300;
    pub const ORDER_UPDATE: i64 = 301;
    pub const HISTORICAL_ORDER_FILLS_REQUEST: i64 = 303;
    pub const HISTORICAL_ORDER_FILL_RESPONSE: i64 = 304;
    pub const CURRENT_POSITIONS_REQUEST: i64 = 305;
    pub const POSITION_UPDATE: i64 = 306;

    pub const TRADE_ACCOUNTS_REQUEST: i64 = 400;
    pub const TRADE_ACCOUNT_RESPONSE: i64 = 401;

    pub const ACCOUNT_BALANCE_UPDATE: i64 = 600;
    pub const ACCOUNT_BALANCE_REQUEST: i64 = 601;
}

/// Outbound requests the bridge can put on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Logon {
        username: String,
        password: String,
        heartbeat_interval_secs: u64,
        protocol_version: i64,
        client_name: String,
    },
    Heartbeat,
    Logoff {
        reason: String,
    },
    TradeAccounts {
        request_id: i64,
    },
    CurrentPositions {
        request_id: i64,
        trade_account: String,
    },
    OpenOrders {
        request_id: i64,
        trade_account: String,
    },
    /// Fills since a timestamp, bounded by a lookback ceiling
    HistoricalOrderFills {
        request_id: i64,
        trade_account: String,
        since: Option<DateTime<Utc>>,
        max_lookback_days: u32,
    },
    AccountBalance {
        request_id: i64,
        trade_account: String,
    },
}

impl Request {
    /// Serialize to the one-object-per-frame JSON the gateway expects
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Request::Logon {
                username,
                password,
                heartbeat_interval_secs,
                protocol_version,
                client_name,
            } => serde_json::json!({
                "Type": type_ids::LOGON_REQUEST,
                "ProtocolVersion": protocol_version,
                "Username": username,
                "Password": password,
                "HeartbeatIntervalInSeconds": heartbeat_interval_secs,
                "ClientName": client_name,
            }),
            Request::Heartbeat => serde_json::json!({
                "Type": type_ids::HEARTBEAT,
                "CurrentDateTime": Utc::now().timestamp(),
            }),
            Request::Logoff { reason } => serde_json::json!({
                "Type": type_ids::LOGOFF,
                "Reason": reason,
            }),
            Request::TradeAccounts { request_id } => serde_json::json!({
                "Type": type_ids::TRADE_ACCOUNTS_REQUEST,
                "RequestID": request_id,
            }),
            Request::CurrentPositions {
                request_id,
                trade_account,
            } => serde_json::json!({
                "Type": type_ids::CURRENT_POSITIONS_REQUEST,
                "RequestID": request_id,
                "TradeAccount": trade_account,
            }),
            Request::OpenOrders {
                request_id,
                trade_account,
            } => serde_json::json!({
                "Type": type_ids::OPEN_ORDERS_REQUEST,
                "RequestID": request_id,
                "TradeAccount": trade_account,
                "RequestAllOrders": 1,
            }),
            Request::HistoricalOrderFills {
                request_id,
                trade_account,
                since,
                max_lookback_days,
            } => {
                let floor = Utc::now() - chrono::Duration::days(*max_lookback_days as i64);
                let start = match since {
                    Some(ts) if *ts > floor => *ts,
                    _ => floor,
                };
                serde_json::json!({
                    "Type": type_ids::HISTORICAL_ORDER_FILLS_REQUEST,
                    "RequestID": request_id,
                    "TradeAccount": trade_account,
                    "StartDateTime": start.timestamp(),
                })
            }
            Request::AccountBalance {
                request_id,
                trade_account,
            } => serde_json::json!({
                "Type": type_ids::ACCOUNT_BALANCE_REQUEST,
                "RequestID": request_id,
                "TradeAccount": trade_account,
            }),
        }
    }
}

/// Logon outcome reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogonStatus {
    Success,
    ErrorNoReconnect,
    Error,
    ReconnectNewAddress,
}

impl LogonStatus {
    pub fn from_wire(code: i64) -> LogonStatus {
        match code {
            1 => LogonStatus::Success,
            2 => LogonStatus::ErrorNoReconnect,
            4 => LogonStatus::ReconnectNewAddress,
            _ => LogonStatus::Error,
        }
    }
}

/// One order update; fields are optional because the gateway sends partial
/// updates, the ledger builder folds them into a terminal view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub account: String,
    pub symbol: Option<Symbol>,
    pub side: Option<Side>,
    pub kind: Option<OrderKind>,
    pub status: Option<OrderStatus>,
    pub reason: Option<String>,
    pub order_quantity: Option<f64>,
    pub filled_quantity: Option<f64>,
    pub remaining_quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub last_fill_price: Option<f64>,
    pub last_fill_quantity: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub text: Option<String>,
}

/// Broker-reported net position snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub account: String,
    pub symbol: Symbol,
    /// Signed quantity: positive long, negative short, zero flat
    pub quantity: f64,
    pub avg_price: f64,
    pub update_reason: Option<String>,
}

/// Cash balance and P&L as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalanceUpdate {
    pub account: String,
    pub cash_balance: f64,
    pub open_pnl: f64,
    pub daily_pnl: f64,
    pub request_id: Option<i64>,
}

/// One entry of the trade accounts listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeAccountResponse {
    pub account: String,
    pub display_name: Option<String>,
    pub request_id: Option<i64>,
}

/// Closed set of typed inbound messages produced by the normalizer.
///
/// Every variant carries enough data to be processed without consulting
/// prior messages, except `OrderUpdate`, whose terminal meaning requires
/// folding by the ledger builder.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedMessage {
    Logon {
        status: LogonStatus,
        text: Option<String>,
    },
    Heartbeat {
        ts: Option<DateTime<Utc>>,
    },
    OrderUpdate(OrderUpdate),
    PositionUpdate(PositionUpdate),
    AccountBalanceUpdate(AccountBalanceUpdate),
    TradeAccountResponse(TradeAccountResponse),
}

impl NormalizedMessage {
    /// Account string carried by the message, when it has one
    pub fn account(&self) -> Option<&str> {
        match self {
            NormalizedMessage::OrderUpdate(u) => Some(&u.account),
            NormalizedMessage::PositionUpdate(u) => Some(&u.account),
            NormalizedMessage::AccountBalanceUpdate(u) => Some(&u.account),
            NormalizedMessage::TradeAccountResponse(u) => Some(&u.account),
            _ => None,
        }
    }
}

/// Epoch seconds (integer or fractional) to a UTC timestamp
pub fn wire_timestamp(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}
