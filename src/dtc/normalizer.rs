//! Message normalizer
//!
//! Converts loosely-typed wire payloads into the closed
//! [`NormalizedMessage`] set. The gateway sends semantically identical
//! values under multiple field names across protocol versions, so each
//! logical field has one resolver with an explicit priority order instead
//! of ad hoc lookups scattered through consumers.

use serde_json::Value;
use tracing::debug;

use super::messages::{
    type_ids, wire_timestamp, AccountBalanceUpdate, LogonStatus, NormalizedMessage, OrderUpdate,
    PositionUpdate, TradeAccountResponse,
};
use crate::types::{OrderKind, OrderStatus, Side, Symbol};

/// Alias priority per logical field, highest first
const ALIASES_ORDER_ID: &[&str] = &["ServerOrderID", "OrderID", "ClientOrderID"];
const ALIASES_ACCOUNT: &[&str] = &["TradeAccount", "Account"];
const ALIASES_ORDER_QTY: &[&str] = &["OrderQuantity", "Quantity", "OrderQty"];
const ALIASES_FILLED_QTY: &[&str] = &["FilledQuantity", "FilledQty", "CumulativeQuantity"];
const ALIASES_REMAINING_QTY: &[&str] = &["RemainingQuantity", "LeavesQuantity"];
const ALIASES_PRICE: &[&str] = &["Price1", "Price", "LimitPrice"];
const ALIASES_STOP_PRICE: &[&str] = &["Price2", "StopPrice"];
const ALIASES_AVG_FILL_PRICE: &[&str] = &["AverageFillPrice", "AvgFillPrice"];
const ALIASES_LAST_FILL_PRICE: &[&str] = &["LastFillPrice", "FillPrice", "Price1"];
const ALIASES_LAST_FILL_QTY: &[&str] = &["LastFillQuantity", "FillQuantity", "LastShares"];
const ALIASES_TIMESTAMP: &[&str] = &[
    "LastFillDateTime",
    "OrderUpdateDateTime",
    "DateTime",
    "CurrentDateTime",
];

/// Map one decoded frame to a typed message.
///
/// Returns `None` for message types outside the modeled subset and for
/// frames missing mandatory fields; both are logged and skipped, never
/// errors.
pub fn normalize(raw: &Value) -> Option<NormalizedMessage> {
    let type_id = raw.get("Type").and_then(Value::as_i64)?;

    match type_id {
        type_ids::LOGON_RESPONSE => Some(NormalizedMessage::Logon {
            status: LogonStatus::from_wire(
                raw.get("Result").and_then(Value::as_i64).unwrap_or(0),
            ),
            text: get_str(raw, &["ResultText", "Text"]),
        }),
        type_ids::HEARTBEAT => Some(NormalizedMessage::Heartbeat {
            ts: get_f64(raw, &["CurrentDateTime"]).and_then(wire_timestamp),
        }),
        type_ids::ORDER_UPDATE => normalize_order_update(raw),
        type_ids::HISTORICAL_ORDER_FILL_RESPONSE => normalize_historical_fill(raw),
        type_ids::POSITION_UPDATE => normalize_position_update(raw),
        type_ids::ACCOUNT_BALANCE_UPDATE => normalize_balance_update(raw),
        type_ids::TRADE_ACCOUNT_RESPONSE => {
            let account = get_str(raw, ALIASES_ACCOUNT)?;
            Some(NormalizedMessage::TradeAccountResponse(
                TradeAccountResponse {
                    account,
                    display_name: get_str(raw, &["AccountName", "DisplayName"]),
                    request_id: raw.get("RequestID").and_then(Value::as_i64),
                },
            ))
        }
        other => {
            debug!("Skipping unmodeled message type {}", other);
            None
        }
    }
}

fn normalize_order_update(raw: &Value) -> Option<NormalizedMessage> {
    let order_id = get_str(raw, ALIASES_ORDER_ID)?;
    let account = get_str(raw, ALIASES_ACCOUNT).unwrap_or_default();

    Some(NormalizedMessage::OrderUpdate(OrderUpdate {
        order_id,
        account,
        symbol: get_str(raw, &["Symbol"]).map(Symbol::new),
        side: get_i64(raw, &["BuySell", "Side"]).and_then(side_from_wire),
        kind: get_i64(raw, &["OrderType"]).map(kind_from_wire),
        status: get_i64(raw, &["OrderStatus"]).map(status_from_wire),
        reason: get_str(raw, &["OrderUpdateReason", "Reason"]),
        order_quantity: get_f64(raw, ALIASES_ORDER_QTY),
        filled_quantity: get_f64(raw, ALIASES_FILLED_QTY),
        remaining_quantity: get_f64(raw, ALIASES_REMAINING_QTY),
        price: get_f64(raw, ALIASES_PRICE),
        stop_price: get_f64(raw, ALIASES_STOP_PRICE),
        avg_fill_price: get_f64(raw, ALIASES_AVG_FILL_PRICE),
        last_fill_price: get_f64(raw, ALIASES_LAST_FILL_PRICE),
        last_fill_quantity: get_f64(raw, ALIASES_LAST_FILL_QTY),
        timestamp: get_f64(raw, ALIASES_TIMESTAMP).and_then(wire_timestamp),
        text: get_str(raw, &["InfoText", "Text"]),
    }))
}

/// Historical fills are folded through the same order-update path; each
/// response row becomes a filled update carrying one execution
fn normalize_historical_fill(raw: &Value) -> Option<NormalizedMessage> {
    let order_id = get_str(raw, ALIASES_ORDER_ID)?;
    let account = get_str(raw, ALIASES_ACCOUNT).unwrap_or_default();
    let price = get_f64(raw, ALIASES_LAST_FILL_PRICE)?;
    let quantity = get_f64(raw, &["Quantity", "LastFillQuantity"])?;

    Some(NormalizedMessage::OrderUpdate(OrderUpdate {
        order_id,
        account,
        symbol: get_str(raw, &["Symbol"]).map(Symbol::new),
        side: get_i64(raw, &["BuySell", "Side"]).and_then(side_from_wire),
        kind: None,
        status: Some(OrderStatus::Filled),
        reason: None,
        order_quantity: Some(quantity),
        filled_quantity: Some(quantity),
        remaining_quantity: Some(0.0),
        price: None,
        stop_price: None,
        avg_fill_price: Some(price),
        last_fill_price: Some(price),
        last_fill_quantity: Some(quantity),
        timestamp: get_f64(raw, ALIASES_TIMESTAMP).and_then(wire_timestamp),
        text: None,
    }))
}

fn normalize_position_update(raw: &Value) -> Option<NormalizedMessage> {
    let account = get_str(raw, ALIASES_ACCOUNT)?;
    let symbol = get_str(raw, &["Symbol"])?;

    Some(NormalizedMessage::PositionUpdate(PositionUpdate {
        account,
        symbol: Symbol::new(symbol),
        quantity: get_f64(raw, &["PositionQuantity", "Quantity"]).unwrap_or(0.0),
        avg_price: get_f64(raw, &["AveragePrice", "AvgPrice", "Price"]).unwrap_or(0.0),
        update_reason: get_str(raw, &["PositionUpdateReason", "Reason"]),
    }))
}

fn normalize_balance_update(raw: &Value) -> Option<NormalizedMessage> {
    let account = get_str(raw, ALIASES_ACCOUNT)?;

    Some(NormalizedMessage::AccountBalanceUpdate(
        AccountBalanceUpdate {
            account,
            cash_balance: get_f64(raw, &["CashBalance", "BalanceAvailableForNewPositions"])
                .unwrap_or(0.0),
            open_pnl: get_f64(raw, &["OpenPositionsProfitLoss", "OpenPnL"]).unwrap_or(0.0),
            daily_pnl: get_f64(raw, &["DailyProfitLoss", "DailyPnL"]).unwrap_or(0.0),
            request_id: raw.get("RequestID").and_then(Value::as_i64),
        },
    ))
}

fn side_from_wire(code: i64) -> Option<Side> {
    match code {
        1 => Some(Side::Buy),
        2 => Some(Side::Sell),
        _ => None,
    }
}

fn kind_from_wire(code: i64) -> OrderKind {
    match code {
        1 => OrderKind::Market,
        2 => OrderKind::Limit,
        3 => OrderKind::Stop,
        4 => OrderKind::StopLimit,
        _ => OrderKind::Unknown,
    }
}

fn status_from_wire(code: i64) -> OrderStatus {
    match code {
        1 | 2 | 3 => OrderStatus::Submitted,
        4 | 5 | 6 => OrderStatus::Open,
        7 => OrderStatus::Filled,
        8 => OrderStatus::Canceled,
        9 => OrderStatus::Rejected,
        10 => OrderStatus::PartiallyFilled,
        _ => OrderStatus::Unspecified,
    }
}

/// First non-empty string among the aliases, in priority order
fn get_str(raw: &Value, aliases: &[&str]) -> Option<String> {
    for key in aliases {
        if let Some(s) = raw.get(*key).and_then(Value::as_str) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// First numeric value among the aliases; numbers stringified by older
/// gateway versions are parsed too
fn get_f64(raw: &Value, aliases: &[&str]) -> Option<f64> {
    for key in aliases {
        match raw.get(*key) {
            Some(Value::Number(n)) => {
                if let Some(f) = n.as_f64() {
                    return Some(f);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(f) = s.parse::<f64>() {
                    return Some(f);
                }
            }
            _ => {}
        }
    }
    None
}

fn get_i64(raw: &Value, aliases: &[&str]) -> Option<i64> {
    for key in aliases {
        match raw.get(*key) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(i);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(i) = s.parse::<i64>() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_normalizes() {
        let raw = serde_json::json!({"Type": 3, "CurrentDateTime": 1700000000});
        match normalize(&raw) {
            Some(NormalizedMessage::Heartbeat { ts }) => {
                assert_eq!(ts.unwrap().timestamp(), 1700000000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unmodeled_type_skipped() {
        let raw = serde_json::json!({"Type": 104, "Symbol": "ESZ5"});
        assert!(normalize(&raw).is_none());
    }

    #[test]
    fn test_order_update_alias_priority() {
        // Both OrderQuantity and Quantity present: higher priority wins
        let raw = serde_json::json!({
            "Type": 301,
            "ServerOrderID": "o-1",
            "TradeAccount": "Sim1",
            "Symbol": "ESZ5",
            "BuySell": 1,
            "OrderStatus": 7,
            "OrderQuantity": 2.0,
            "Quantity": 99.0,
            "LastFillPrice": 5801.25,
            "FillPrice": 1.0,
        });
        match normalize(&raw) {
            Some(NormalizedMessage::OrderUpdate(u)) => {
                assert_eq!(u.order_quantity, Some(2.0));
                assert_eq!(u.last_fill_price, Some(5801.25));
                assert_eq!(u.side, Some(Side::Buy));
                assert_eq!(u.status, Some(OrderStatus::Filled));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_lower_priority_alias_used_as_fallback() {
        let raw = serde_json::json!({
            "Type": 301,
            "OrderID": "o-2",
            "Account": "Sim1",
            "Quantity": 3.0,
        });
        match normalize(&raw) {
            Some(NormalizedMessage::OrderUpdate(u)) => {
                assert_eq!(u.order_id, "o-2");
                assert_eq!(u.account, "Sim1");
                assert_eq!(u.order_quantity, Some(3.0));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_stringified_numbers_parsed() {
        let raw = serde_json::json!({
            "Type": 306,
            "TradeAccount": "Sim1",
            "Symbol": "ESZ5",
            "PositionQuantity": "-2",
            "AveragePrice": "5800.50",
        });
        match normalize(&raw) {
            Some(NormalizedMessage::PositionUpdate(p)) => {
                assert_eq!(p.quantity, -2.0);
                assert_eq!(p.avg_price, 5800.50);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_order_update_without_id_skipped() {
        let raw = serde_json::json!({"Type": 301, "TradeAccount": "Sim1"});
        assert!(normalize(&raw).is_none());
    }

    #[test]
    fn test_balance_update() {
        let raw = serde_json::json!({
            "Type": 600,
            "TradeAccount": "120005",
            "CashBalance": 52340.75,
            "OpenPositionsProfitLoss": -120.0,
            "DailyProfitLoss": 310.25,
            "RequestID": 4,
        });
        match normalize(&raw) {
            Some(NormalizedMessage::AccountBalanceUpdate(b)) => {
                assert_eq!(b.account, "120005");
                assert_eq!(b.cash_balance, 52340.75);
                assert_eq!(b.open_pnl, -120.0);
                assert_eq!(b.daily_pnl, 310.25);
                assert_eq!(b.request_id, Some(4));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_historical_fill_becomes_filled_order_update() {
        let raw = serde_json::json!({
            "Type": 304,
            "ServerOrderID": "h-1",
            "TradeAccount": "Sim1",
            "Symbol": "ESZ5",
            "BuySell": 2,
            "Price1": 5810.0,
            "Quantity": 1.0,
            "DateTime": 1700000100,
        });
        match normalize(&raw) {
            Some(NormalizedMessage::OrderUpdate(u)) => {
                assert_eq!(u.status, Some(OrderStatus::Filled));
                assert_eq!(u.last_fill_price, Some(5810.0));
                assert_eq!(u.last_fill_quantity, Some(1.0));
                assert_eq!(u.side, Some(Side::Sell));
                assert_eq!(u.timestamp.unwrap().timestamp(), 1700000100);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_logon_response() {
        let raw = serde_json::json!({"Type": 2, "Result": 1, "ResultText": "ok"});
        match normalize(&raw) {
            Some(NormalizedMessage::Logon { status, text }) => {
                assert_eq!(status, LogonStatus::Success);
                assert_eq!(text.as_deref(), Some("ok"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
