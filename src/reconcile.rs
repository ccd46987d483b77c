// =============================================================================
// Reconciliation — periodic exchange/local position drift detection
// =============================================================================
//
// Runs periodically (default 5 minutes) against every connection backing an
// active strategy. For each, pulls remote positions via the gateway's
// optional `get_positions` capability and compares them against the
// authoritative local state within a small tolerance. Drift is reported as a
// `RiskAlert`; local state is never auto-corrected — corrections are
// operator-initiated, driven off the same alert an operator would see.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::event_bus::{Bus, EngineEvent};
use crate::gateway::pool::GatewayPool;
use crate::gateway::RemotePosition;
use crate::persistence::Store;
use crate::state_manager::StateManager;

/// `|Δqty| > QTY_TOLERANCE` is treated as drift, not floating-point noise.
pub const QTY_TOLERANCE: f64 = 1e-8;
/// Average-entry-price drift tolerance, relative to price magnitude; looser
/// than the quantity check since exchanges round differently.
pub const AVG_PRICE_TOLERANCE: f64 = 1e-6;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Reconciler {
    store: Arc<dyn Store>,
    bus: Arc<Bus>,
    gateway_pool: Arc<GatewayPool>,
    state_manager: Arc<StateManager>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<Bus>,
        gateway_pool: Arc<GatewayPool>,
        state_manager: Arc<StateManager>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            gateway_pool,
            state_manager,
            interval,
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
        });
    }

    /// One reconciliation pass over every distinct `(user_id, connection_id)`
    /// pair backing an active strategy.
    pub async fn run_once(&self) {
        let strategies = match self.store.list_active_strategies().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "reconciliation: failed to list active strategies");
                return;
            }
        };

        let mut seen: HashSet<(String, String)> = HashSet::new();
        for strategy in strategies {
            let Some(connection_id) = strategy.connection_id.clone() else {
                continue;
            };
            if !seen.insert((strategy.user_id.clone(), connection_id.clone())) {
                continue;
            }
            self.reconcile_connection(&strategy.user_id, &connection_id).await;
        }
    }

    async fn reconcile_connection(&self, user_id: &str, connection_id: &str) {
        let gateway = match self.gateway_pool.get_or_create(user_id, connection_id).await {
            Ok(g) => g,
            Err(e) => {
                warn!(user_id, connection_id, error = %e, "reconciliation: gateway unavailable");
                return;
            }
        };

        // Gateways without a positions capability default to an empty list
        // (see `Gateway::get_positions`) — no drift can be computed for
        // them, which is the intended "only when exchange supports it"
        // behavior for an empty local book. A non-flat local book against
        // an unsupported gateway will read as drift; that is an accepted
        // false-positive rather than silently skipping real exchanges that
        // happen to report zero positions.
        let remote = match gateway.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(user_id, connection_id, error = %e, "reconciliation: failed to pull remote positions");
                return;
            }
        };

        let local = self.state_manager.positions(user_id);

        for remote_pos in &remote {
            let local_match = local.iter().find(|p| p.symbol == remote_pos.symbol);
            let (local_qty, local_avg) = local_match
                .map(|p| (p.qty, p.avg_entry_price))
                .unwrap_or((0.0, 0.0));

            if let Some(reason) = drift_reason(remote_pos, local_qty, local_avg) {
                self.emit_drift_alert(user_id, &remote_pos.symbol, &reason);
            }
        }

        for local_pos in &local {
            if local_pos.qty == 0.0 {
                continue;
            }
            if remote.iter().any(|r| r.symbol == local_pos.symbol) {
                continue;
            }
            let reason = format!(
                "local reports qty={} for {} but remote has no matching position",
                local_pos.qty, local_pos.symbol
            );
            self.emit_drift_alert(user_id, &local_pos.symbol, &reason);
        }
    }

    fn emit_drift_alert(&self, user_id: &str, symbol: &str, reason: &str) {
        warn!(user_id, symbol, reason, "reconciliation: position drift detected");
        self.bus.publish(EngineEvent::RiskAlert {
            user_id: Some(user_id.to_string()),
            kind: "POSITION_DRIFT".to_string(),
            reason: reason.to_string(),
        });
    }
}

fn drift_reason(remote: &RemotePosition, local_qty: f64, local_avg: f64) -> Option<String> {
    let qty_delta = (remote.qty - local_qty).abs();
    if qty_delta > QTY_TOLERANCE {
        return Some(format!(
            "qty drift on {}: remote={} local={} (Δ={})",
            remote.symbol, remote.qty, local_qty, qty_delta
        ));
    }

    if local_qty != 0.0 {
        let avg_delta = (remote.avg_price - local_avg).abs();
        if avg_delta > AVG_PRICE_TOLERANCE {
            return Some(format!(
                "avg_price drift on {}: remote={} local={} (Δ={})",
                remote.symbol, remote.avg_price, local_avg, avg_delta
            ));
        }
    }

    None
}
