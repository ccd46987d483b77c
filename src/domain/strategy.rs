// =============================================================================
// Strategy Instance — a user's configured strategy, and the capability a
// concrete strategy implementation must provide
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ProfitTargetType, Side, StrategyStatus};

/// A user-owned strategy instance loaded from the persistence store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInstance {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Strategy type tag (e.g. "ema_cross"); content lives outside this
    /// engine — the dispatcher only needs to route ticks to the instance.
    pub strategy_type: String,
    pub symbol: String,
    pub interval: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    pub status: StrategyStatus,
    #[serde(default)]
    pub profit_target: f64,
    #[serde(default)]
    pub profit_target_type: ProfitTargetType,
    /// Account balance snapshot captured on first transition to `Active`,
    /// used as the denominator for `PERCENT` profit targets (see
    /// `profit_target::check`).
    #[serde(default)]
    pub initial_capital: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ProfitTargetType {
    fn default() -> Self {
        Self::Absolute
    }
}

impl StrategyInstance {
    pub fn is_active(&self) -> bool {
        self.status == StrategyStatus::Active
    }

    /// §3 invariant: a non-empty `connection_id` must reference an active
    /// connection owned by the same user. This only checks the local
    /// consistency the instance itself can state; the actual ownership check
    /// requires the persistence store (see `pipeline::resolve_connection`).
    pub fn has_bound_connection(&self) -> bool {
        self.connection_id.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// A signal emitted by a strategy instance on a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
}

/// Capability every strategy content implementation provides. Indicator
/// math and strategy logic are out of scope for this engine; this trait is
/// the seam a strategy worker plugs into.
pub trait Strategy: Send + Sync {
    /// Evaluate one tick for this strategy's symbol. `indicators` is the map
    /// produced by `indicators::engine::IndicatorEngine::update`.
    ///
    /// May panic — the dispatcher wraps every call in a panic guard and
    /// quarantines the offending instance on unwind (see
    /// `strategy_engine::StrategyEngine::dispatch_tick`).
    fn on_tick(&self, symbol: &str, price: f64, indicators: &HashMap<String, f64>)
        -> Option<Signal>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StrategyInstance {
        StrategyInstance {
            id: "s1".into(),
            user_id: "u1".into(),
            connection_id: None,
            strategy_type: "ema_cross".into(),
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            params: HashMap::new(),
            status: StrategyStatus::Active,
            profit_target: 0.0,
            profit_target_type: ProfitTargetType::Absolute,
            initial_capital: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn active_status_is_reported() {
        let mut s = sample();
        assert!(s.is_active());
        s.status = StrategyStatus::Paused;
        assert!(!s.is_active());
    }

    #[test]
    fn bound_connection_detection() {
        let mut s = sample();
        assert!(!s.has_bound_connection());
        s.connection_id = Some("conn-1".into());
        assert!(s.has_bound_connection());
        s.connection_id = Some(String::new());
        assert!(!s.has_bound_connection());
    }
}
