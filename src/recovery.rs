//! Reconnect recovery pull
//!
//! After a session is (re)established the local picture is rebuilt in a
//! fixed order: persisted positions are republished, then the gateway is
//! asked for current positions, open orders, historical fills since the
//! last recorded fill, and finally account balances. Health stays
//! RECONNECTING until the pull completes; a pull that exceeds its
//! timeout degrades health instead of blocking the session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::common::circuit_breaker::CircuitStats;
use crate::config::{ResilienceConfig, StoreConfig};
use crate::dtc::connection::Session;
use crate::dtc::messages::{NormalizedMessage, Request};
use crate::error::SendError;
use crate::events::{self, CoreEvent, EventSink, HealthState};
use crate::store::TradeStore;

/// Snapshot phases the pull waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Phase {
    Positions,
    Orders,
    Balance,
}

#[derive(Default)]
struct PullState {
    in_flight: bool,
    pending: HashSet<Phase>,
    generation: u64,
}

pub struct RecoveryCoordinator {
    store: Arc<dyn TradeStore>,
    resilience: ResilienceConfig,
    store_cfg: StoreConfig,
    sink: EventSink,
    state: Mutex<PullState>,
}

impl RecoveryCoordinator {
    pub fn new(
        store: Arc<dyn TradeStore>,
        resilience: ResilienceConfig,
        store_cfg: StoreConfig,
        sink: EventSink,
    ) -> Self {
        RecoveryCoordinator {
            store,
            resilience,
            store_cfg,
            sink,
            state: Mutex::new(PullState::default()),
        }
    }

    /// Issue the snapshot requests for one account, oldest state first.
    /// Spawns a watchdog that degrades health if the gateway does not
    /// answer every phase within the pull timeout.
    pub async fn begin(
        self: &Arc<Self>,
        session: &Session,
        trade_account: &str,
        breaker_stats: CircuitStats,
    ) -> Result<(), SendError> {
        let since = match self.store.last_recorded_fill_ts() {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, "Could not read last fill timestamp, pulling full lookback");
                None
            }
        };

        let generation = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_flight = true;
            state.pending =
                [Phase::Positions, Phase::Orders, Phase::Balance].into_iter().collect();
            state.generation += 1;
            state.generation
        };

        info!(
            account = trade_account,
            since = ?since,
            "Starting recovery pull"
        );

        session
            .send(&Request::CurrentPositions {
                request_id: session.next_request_id(),
                trade_account: trade_account.to_string(),
            })
            .await?;
        session
            .send(&Request::OpenOrders {
                request_id: session.next_request_id(),
                trade_account: trade_account.to_string(),
            })
            .await?;
        session
            .send(&Request::HistoricalOrderFills {
                request_id: session.next_request_id(),
                trade_account: trade_account.to_string(),
                since,
                max_lookback_days: self.store_cfg.max_lookback_days,
            })
            .await?;
        session
            .send(&Request::AccountBalance {
                request_id: session.next_request_id(),
                trade_account: trade_account.to_string(),
            })
            .await?;

        let coordinator = Arc::clone(self);
        let timeout = self.resilience.recovery_pull_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let timed_out = {
                let state = coordinator.state.lock().unwrap_or_else(|e| e.into_inner());
                state.in_flight && state.generation == generation
            };
            if timed_out {
                warn!(
                    elapsed_secs = timeout.as_secs(),
                    "Recovery pull timed out, state may be stale"
                );
                events::emit(
                    &coordinator.sink,
                    CoreEvent::ConnectionHealth {
                        state: HealthState::Degraded,
                        stats: breaker_stats,
                    },
                );
            }
        });
        Ok(())
    }

    /// Feed an inbound message; completes the matching phase. Returns
    /// true when this message finished the pull.
    pub fn observe(&self, message: &NormalizedMessage) -> bool {
        let phase = match message {
            NormalizedMessage::PositionUpdate(_) => Phase::Positions,
            NormalizedMessage::OrderUpdate(_) => Phase::Orders,
            NormalizedMessage::AccountBalanceUpdate(_) => Phase::Balance,
            _ => return false,
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.in_flight {
            return false;
        }
        if state.pending.remove(&phase) {
            debug!(phase = ?phase, "Recovery phase answered");
        }
        if state.pending.is_empty() {
            state.in_flight = false;
            info!("Recovery pull complete");
            return true;
        }
        false
    }

    /// A gateway with no resting state never answers some phases, so a
    /// quiet pull is force-completed once the session turns idle.
    pub fn settle(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.in_flight {
            debug!(pending = state.pending.len(), "Settling quiet recovery pull");
            state.in_flight = false;
            state.pending.clear();
            return true;
        }
        false
    }

    pub fn is_in_flight(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_flight
    }
}
