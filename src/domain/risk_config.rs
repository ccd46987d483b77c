// =============================================================================
// RiskConfig / RiskMetrics — the tunables and the daily rolling state the
// risk manager evaluates signals against
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::FailureMode;

/// Global (or per-strategy-overridable) risk tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_total_exposure: f64,
    pub max_daily_loss: f64,
    pub max_daily_trades: u32,
    pub default_stop_loss_pct: f64,
    pub default_take_profit_pct: f64,
    pub use_trailing_stop: bool,
    pub trailing_percent: f64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_caution_threshold")]
    pub caution_threshold: f64,
    #[serde(default)]
    pub failure_mode: FailureMode,
    #[serde(default = "default_min_order_size")]
    pub min_order_size: f64,
    #[serde(default = "default_max_order_size")]
    pub max_order_size: f64,
}

fn default_warning_threshold() -> f64 {
    0.8
}

fn default_caution_threshold() -> f64 {
    0.9
}

fn default_min_order_size() -> f64 {
    0.0
}

fn default_max_order_size() -> f64 {
    f64::MAX
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_total_exposure: 10_000.0,
            max_daily_loss: 1_000.0,
            max_daily_trades: 100,
            default_stop_loss_pct: 0.02,
            default_take_profit_pct: 0.04,
            use_trailing_stop: false,
            trailing_percent: 0.01,
            warning_threshold: default_warning_threshold(),
            caution_threshold: default_caution_threshold(),
            failure_mode: FailureMode::FailClose,
            min_order_size: default_min_order_size(),
            max_order_size: default_max_order_size(),
        }
    }
}

/// Per-strategy override layered on top of the global `RiskConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRiskOverride {
    pub strategy_id: String,
    pub max_position_size: f64,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Per-user, per-day rolling risk state. Reset at UTC midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub user_id: String,
    pub date: NaiveDate,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub total_exposure: f64,
}

impl RiskMetrics {
    pub fn new_for_today(user_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            date,
            daily_pnl: 0.0,
            daily_trades: 0,
            total_exposure: 0.0,
        }
    }

    pub fn roll_if_new_day(&mut self, today: NaiveDate) {
        if self.date != today {
            self.date = today;
            self.daily_pnl = 0.0;
            self.daily_trades = 0;
            // total_exposure carries over: it reflects live positions, not
            // a daily counter.
        }
    }

    pub fn record_trade(&mut self, pnl_delta: f64) {
        self.daily_pnl += pnl_delta;
        self.daily_trades += 1;
    }

    pub fn daily_loss_ratio(&self, max_daily_loss: f64) -> f64 {
        if max_daily_loss <= 0.0 {
            return 0.0;
        }
        (-self.daily_pnl).max(0.0) / max_daily_loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_thresholds() {
        let cfg = RiskConfig::default();
        assert!(cfg.warning_threshold < cfg.caution_threshold);
        assert!(cfg.caution_threshold < 1.0);
    }

    #[test]
    fn roll_if_new_day_resets_trades_and_pnl_but_not_exposure() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 27).unwrap();
        let mut m = RiskMetrics::new_for_today("u1", today);
        m.record_trade(-50.0);
        m.total_exposure = 1000.0;

        let tomorrow = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        m.roll_if_new_day(tomorrow);

        assert_eq!(m.daily_pnl, 0.0);
        assert_eq!(m.daily_trades, 0);
        assert_eq!(m.total_exposure, 1000.0);
    }

    #[test]
    fn daily_loss_ratio_only_counts_negative_pnl() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 27).unwrap();
        let mut m = RiskMetrics::new_for_today("u1", today);
        m.record_trade(200.0);
        assert_eq!(m.daily_loss_ratio(1000.0), 0.0);

        m.record_trade(-700.0);
        assert!((m.daily_loss_ratio(1000.0) - 0.5).abs() < 1e-9);
    }
}
