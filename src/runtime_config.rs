// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable that governs execution mode, durability, and per-user risk
// defaults lives here. Persistence uses an atomic tmp + rename pattern to
// prevent corruption on crash. All fields carry `#[serde(default = "...")]`
// so that adding new fields never breaks loading an older config file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::risk_config::RiskConfig;
use crate::types::{BalanceSource, TradingMode};

fn default_dry_run_initial_balance() -> f64 {
    10_000.0
}

fn default_order_wal_path() -> String {
    "order_queue.wal".to_string()
}

fn default_gateway_pool_max_size() -> usize {
    crate::gateway::pool::DEFAULT_MAX_SIZE
}

fn default_idle_timeout_secs() -> u64 {
    crate::gateway::pool::DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_health_interval_secs() -> u64 {
    crate::gateway::pool::DEFAULT_HEALTH_INTERVAL.as_secs()
}

fn default_reconcile_interval_secs() -> u64 {
    5 * 60
}

/// Top-level runtime configuration for the engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Global kill switch: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Replaces exchange submission with a mock executor; persists orders
    /// and simulates fills/PnL.
    #[serde(default)]
    pub dry_run: bool,

    /// If false, behaves as dry-run regardless of `dry_run`.
    #[serde(default)]
    pub execution_enabled: bool,

    /// Seed for the fixed balance manager when `balance_source = Fixed`.
    #[serde(default = "default_dry_run_initial_balance")]
    pub dry_run_initial_balance: f64,

    #[serde(default)]
    pub balance_source: BalanceSource,

    #[serde(default)]
    pub enable_order_wal: bool,

    #[serde(default = "default_order_wal_path")]
    pub order_wal_path: String,

    #[serde(default)]
    pub dry_run_fee_rate: f64,

    #[serde(default)]
    pub dry_run_slippage_bps: f64,

    #[serde(default)]
    pub dry_run_gateway_latency_min_ms: u64,

    #[serde(default)]
    pub dry_run_gateway_latency_max_ms: u64,

    #[serde(default = "default_gateway_pool_max_size")]
    pub gateway_pool_max_size: usize,

    /// Seconds; converted to `Duration` at the gateway pool construction
    /// site since no duration-serde crate is in the dependency tree.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Per-user default risk configuration; `StrategyRiskOverride`s are
    /// applied on top of this per strategy.
    #[serde(default)]
    pub risk: RiskConfig,

    /// Seed for `KeyManager`; required when any connection is encrypted.
    /// Read from config or the `MASTER_ENCRYPTION_KEY` environment variable
    /// — never both logged.
    #[serde(default)]
    pub master_encryption_key: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            dry_run: true,
            execution_enabled: false,
            dry_run_initial_balance: default_dry_run_initial_balance(),
            balance_source: BalanceSource::Auto,
            enable_order_wal: true,
            order_wal_path: default_order_wal_path(),
            dry_run_fee_rate: 0.0,
            dry_run_slippage_bps: 0.0,
            dry_run_gateway_latency_min_ms: 0,
            dry_run_gateway_latency_max_ms: 0,
            gateway_pool_max_size: default_gateway_pool_max_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            health_interval_secs: default_health_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            risk: RiskConfig::default(),
            master_encryption_key: None,
        }
    }
}

impl RuntimeConfig {
    /// Whether orders should bypass the real exchange: either explicit
    /// dry-run, or execution globally disabled.
    pub fn effective_dry_run(&self) -> bool {
        self.dry_run || !self.execution_enabled
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            trading_mode = %config.trading_mode,
            dry_run = config.dry_run,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename). Prevents corruption if the process
    /// crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
