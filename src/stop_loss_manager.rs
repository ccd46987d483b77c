// =============================================================================
// Stop-Loss Manager — per-(strategy, symbol) exit tracking
// =============================================================================
//
// Tracked independently of the authoritative `Position` (see
// `domain::position`) because several strategy instances belonging to
// different users can hold independent stop levels on the same symbol.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::domain::stop_loss::{StopLossPosition, StopLossSide};
use crate::types::Side;

#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub triggered: bool,
    pub reason: &'static str,
    pub side_to_close: StopLossSide,
}

pub struct StopLossManager {
    entries: RwLock<HashMap<(String, String), StopLossPosition>>,
}

impl StopLossManager {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, position: StopLossPosition) {
        let key = (position.strategy_id.clone(), position.symbol.clone());
        self.entries.write().insert(key, position);
    }

    /// Update every tracked entry for `symbol` against the new `price`.
    /// Returns triggers for every `(strategy_id, symbol)` key whose exit
    /// fired on this tick — at most one trigger per key per call.
    pub fn update_price(&self, symbol: &str, price: f64) -> Vec<(String, ExitDecision)> {
        let mut triggered = Vec::new();
        let mut entries = self.entries.write();

        for ((strategy_id, sym), entry) in entries.iter_mut() {
            if sym != symbol {
                continue;
            }
            entry.update_price(price);
            if let Some((side_to_close, reason)) = entry.check_exit() {
                triggered.push((
                    strategy_id.clone(),
                    ExitDecision {
                        triggered: true,
                        reason,
                        side_to_close,
                    },
                ));
            }
        }
        triggered
    }

    pub fn remove(&self, strategy_id: &str, symbol: &str) {
        self.entries
            .write()
            .remove(&(strategy_id.to_string(), symbol.to_string()));
    }

    pub fn get(&self, strategy_id: &str, symbol: &str) -> Option<StopLossPosition> {
        self.entries
            .read()
            .get(&(strategy_id.to_string(), symbol.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StopLossManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_update_price_triggers_stop_loss() {
        let mgr = StopLossManager::new();
        mgr.add(StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 90.0, Some(120.0)));

        let triggers = mgr.update_price("BTCUSDT", 89.0);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].0, "s1");
        assert_eq!(triggers[0].1.reason, "STOP_LOSS");
    }

    #[test]
    fn update_price_only_touches_matching_symbol() {
        let mgr = StopLossManager::new();
        mgr.add(StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 90.0, None));
        mgr.add(StopLossPosition::new("s2", "ETHUSDT", Side::Buy, 100.0, 90.0, None));

        let triggers = mgr.update_price("BTCUSDT", 80.0);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].0, "s1");
    }

    #[test]
    fn remove_clears_the_entry() {
        let mgr = StopLossManager::new();
        mgr.add(StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 90.0, None));
        assert_eq!(mgr.len(), 1);
        mgr.remove("s1", "BTCUSDT");
        assert!(mgr.is_empty());
    }

    #[test]
    fn multiple_strategies_on_same_symbol_are_tracked_independently() {
        let mgr = StopLossManager::new();
        mgr.add(StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 90.0, None));
        mgr.add(StopLossPosition::new("s2", "BTCUSDT", Side::Buy, 100.0, 95.0, None));

        let triggers = mgr.update_price("BTCUSDT", 92.0);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].0, "s2");
    }
}
