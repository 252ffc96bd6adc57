//! Core -> presentation event sink
//!
//! The presentation layer observes the core exclusively through this
//! channel; it never reaches back into core state. Delivery is an
//! explicit queue between the network context and the consumer context.

use tokio::sync::mpsc;

use crate::common::circuit_breaker::CircuitStats;
use crate::types::{BalanceRecord, ClosedTrade, OpenPosition, Scope};

/// Connection health as shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Connected,
    /// Connected but state may be stale (recovery pull timed out)
    Degraded,
    Reconnecting,
    Down,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Connected => write!(f, "CONNECTED"),
            HealthState::Degraded => write!(f, "DEGRADED"),
            HealthState::Reconnecting => write!(f, "RECONNECTING"),
            HealthState::Down => write!(f, "DOWN"),
        }
    }
}

/// Mutation-free outputs the presentation layer may observe
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Position opened, updated, or gone (None) for a scope
    PositionChanged {
        scope: Scope,
        position: Option<OpenPosition>,
        /// Set on recovery republish when the row exceeded the staleness
        /// window and needs manual confirmation
        needs_confirmation: bool,
    },
    TradeClosed(ClosedTrade),
    BalanceChanged {
        scope: Scope,
        balance: BalanceRecord,
    },
    ModeChanged(Scope),
    ConnectionHealth {
        state: HealthState,
        stats: CircuitStats,
    },
    /// Mode drift detected; any live-order submission gate must disarm
    LiveGateDisarmed {
        reason: String,
    },
}

/// Sender half handed to core components
pub type EventSink = mpsc::UnboundedSender<CoreEvent>;

/// Receiver half owned by the presentation layer
pub type EventStream = mpsc::UnboundedReceiver<CoreEvent>;

pub fn channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

/// Send an event, tolerating a departed consumer
pub fn emit(sink: &EventSink, event: CoreEvent) {
    if sink.send(event).is_err() {
        tracing::debug!("Event dropped, presentation layer is gone");
    }
}
