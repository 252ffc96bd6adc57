//! Trade metric calculations
//!
//! Free functions over immutable position snapshots: realized P&L,
//! maximum adverse/favorable excursion, efficiency, and R-multiple.
//! Nothing here reads or mutates hidden state, so every formula is
//! independently testable.

use chrono::{DateTime, Utc};

use crate::types::{ClosedTrade, OpenPosition, Side};

/// Exit terms applied when a position closes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitFill {
    pub price: f64,
    pub time: DateTime<Utc>,
    /// Dollar value of one point of price movement
    pub point_value: f64,
    /// Round-trip commission for the whole position
    pub commission: f64,
}

/// Realized P&L in dollars for a completed round trip
pub fn realized_pnl(
    side: Side,
    entry_price: f64,
    exit_price: f64,
    quantity: f64,
    point_value: f64,
) -> f64 {
    side.sign() * (exit_price - entry_price) * quantity.abs() * point_value
}

/// Maximum adverse excursion in points: the worst the trade went against
/// the position while it was open
pub fn mae_points(side: Side, entry_price: f64, min_price: f64, max_price: f64) -> f64 {
    let points = match side {
        Side::Buy => entry_price - min_price,
        Side::Sell => max_price - entry_price,
    };
    points.max(0.0)
}

/// Maximum favorable excursion in points: the best the trade went for
/// the position while it was open
pub fn mfe_points(side: Side, entry_price: f64, min_price: f64, max_price: f64) -> f64 {
    let points = match side {
        Side::Buy => max_price - entry_price,
        Side::Sell => entry_price - min_price,
    };
    points.max(0.0)
}

/// Points to dollars for a given size
pub fn points_to_dollars(points: f64, quantity: f64, point_value: f64) -> f64 {
    points * quantity.abs() * point_value
}

/// Fraction of the best available move that was captured; 0 when the
/// trade never went favorable
pub fn efficiency(realized_pnl: f64, mfe_dollars: f64) -> f64 {
    if mfe_dollars > 0.0 {
        realized_pnl / mfe_dollars
    } else {
        0.0
    }
}

/// Realized P&L over the risk implied by the stop at entry; `None`
/// without a stop or with a stop at the entry price
pub fn r_multiple(
    realized_pnl: f64,
    entry_price: f64,
    stop_price: Option<f64>,
    quantity: f64,
    point_value: f64,
) -> Option<f64> {
    let stop = stop_price?;
    let risk = points_to_dollars((entry_price - stop).abs(), quantity, point_value);
    if risk > 0.0 {
        Some(realized_pnl / risk)
    } else {
        None
    }
}

/// Assemble the immutable closed-trade record from the open position and
/// the exit terms. The exit price participates in the excursion extremes,
/// so a close beyond the observed range extends MAE/MFE.
pub fn build_closed_trade(position: &OpenPosition, exit: &ExitFill) -> ClosedTrade {
    let quantity = position.abs_quantity();
    let min_price = position.min_trade_price.min(exit.price);
    let max_price = position.max_trade_price.max(exit.price);

    let pnl = realized_pnl(
        position.side,
        position.entry_price,
        exit.price,
        quantity,
        exit.point_value,
    ) - exit.commission;

    let mae = points_to_dollars(
        mae_points(position.side, position.entry_price, min_price, max_price),
        quantity,
        exit.point_value,
    );
    let mfe = points_to_dollars(
        mfe_points(position.side, position.entry_price, min_price, max_price),
        quantity,
        exit.point_value,
    );

    ClosedTrade {
        scope: position.scope.clone(),
        symbol: position.symbol.clone(),
        side: position.side,
        quantity,
        entry_price: position.entry_price,
        exit_price: exit.price,
        entry_time: position.entry_time,
        exit_time: exit.time,
        realized_pnl: pnl,
        commission: exit.commission,
        mae,
        mfe,
        efficiency: efficiency(pnl, mfe),
        r_multiple: r_multiple(
            pnl,
            position.entry_price,
            position.stop_price,
            quantity,
            exit.point_value,
        ),
        entry_context: position.entry_context.clone(),
    }
}
