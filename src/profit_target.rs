// =============================================================================
// Profit-Target Check — post-fill strategy auto-stop
// =============================================================================
//
// Tracks cumulative realized PnL per strategy instance in memory (the store
// only holds per-trade fees/prices, not a running total) and stops a
// strategy once its configured target is reached.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::EngineError;
use crate::event_bus::{Bus, EngineEvent};
use crate::persistence::Store;
use crate::types::{ProfitTargetType, StrategyStatus};

pub struct ProfitTargetTracker {
    realized: RwLock<HashMap<String, f64>>,
    store: Arc<dyn Store>,
    bus: Arc<Bus>,
}

impl ProfitTargetTracker {
    pub fn new(store: Arc<dyn Store>, bus: Arc<Bus>) -> Self {
        Self {
            realized: RwLock::new(HashMap::new()),
            store,
            bus,
        }
    }

    /// Accumulate `net_pnl` for `strategy_id` and check whether its target
    /// is now reached. Called by the fill consumer after every fill that
    /// belongs to a strategy.
    pub async fn record_and_check(&self, strategy_id: &str, net_pnl: f64) -> Result<(), EngineError> {
        let total = {
            let mut realized = self.realized.write();
            let entry = realized.entry(strategy_id.to_string()).or_insert(0.0);
            *entry += net_pnl;
            *entry
        };

        let Some(mut strategy) = self.store.get_strategy(strategy_id).await? else {
            return Ok(());
        };

        if strategy.profit_target <= 0.0 || !strategy.is_active() {
            return Ok(());
        }

        let reached = match strategy.profit_target_type {
            ProfitTargetType::Absolute => total >= strategy.profit_target,
            ProfitTargetType::Percent => match strategy.initial_capital {
                Some(capital) if capital > 0.0 => total / capital >= strategy.profit_target,
                _ => false,
            },
        };

        if reached {
            strategy.status = StrategyStatus::Stopped;
            strategy.updated_at = chrono::Utc::now();
            self.store.put_strategy(strategy.clone()).await?;

            info!(strategy_id, total, "profit target reached, strategy stopped");
            self.bus.publish(EngineEvent::RiskAlert {
                user_id: Some(strategy.user_id.clone()),
                kind: "PROFIT_TARGET_REACHED".to_string(),
                reason: format!("strategy {strategy_id} reached profit target ({total})"),
            });
        }

        Ok(())
    }

    pub fn realized_pnl(&self, strategy_id: &str) -> f64 {
        *self.realized.read().get(strategy_id).unwrap_or(&0.0)
    }
}
