// =============================================================================
// Shared types used across the trading engine core
// =============================================================================
//
// Every cross-cutting enum used by more than one subsystem lives here so that
// `risk_manager`, `executor`, `gateway`, and the persistence layer agree on a
// single vocabulary. Identifiers (`user_id`, `order_id`, ...) are plain
// `String`s — UUIDv4 for engine-generated ids, opaque for ids supplied by
// callers (e.g. `user_id` from the auth/registration system out of scope
// here).

use serde::{Deserialize, Serialize};

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// `ExecutionMode` is a distinct variant of the executor capability (see
/// `executor.rs`), not a flag sprinkled through the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Production,
    DryRun,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "Production"),
            Self::DryRun => write!(f, "DryRun"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl Side {
    /// +1 for BUY, -1 for SELL — the sign convention used throughout position
    /// and PnL math.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Order type, matching the exchange gateway's `OrderRequest` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLossLimit,
    TakeProfit,
    TakeProfitLimit,
    LimitMaker,
    TrailingStopMarket,
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Gtx,
}

/// Market / product type an order targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketType {
    Spot,
    UsdtFutures,
    CoinFutures,
}

/// Position side for hedge-mode futures accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

/// Working price type for conditional (stop) orders on futures markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkingType {
    MarkPrice,
    ContractPrice,
}

/// Lifecycle status of an in-flight order.
///
/// `NEW -> (SUBMITTED | REJECTED) -> (FILLED | PARTIALLY_FILLED | CANCELED |
/// EXPIRED)` per the data model's invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Submitted,
    Rejected,
    Filled,
    PartiallyFilled,
    Canceled,
    Expired,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Submitted => "SUBMITTED",
            Self::Rejected => "REJECTED",
            Self::Filled => "FILLED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Expired | Self::Rejected
        )
    }
}

/// Status returned by an exchange gateway's `submit_order` result. A superset
/// of `OrderStatus` because gateways may report states the engine has not
/// yet classified (`Unknown`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayOrderStatus {
    New,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Unknown,
}

/// Status of a user-defined strategy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Active,
    Paused,
    Stopped,
    Error,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Whether a strategy's `profit_target` is an absolute quote-currency amount
/// or a fraction of initial capital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfitTargetType {
    Absolute,
    Percent,
}

/// Risk manager tiering, computed from exposure/loss ratios against their
/// configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitLevel {
    Normal,
    Warning,
    Caution,
    Limit,
}

impl std::fmt::Display for LimitLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "NORMAL",
            Self::Warning => "WARNING",
            Self::Caution => "CAUTION",
            Self::Limit => "LIMIT",
        };
        write!(f, "{s}")
    }
}

/// How the risk engine behaves when a dependent store read fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureMode {
    FailClose,
    FailLimit,
}

impl Default for FailureMode {
    fn default() -> Self {
        Self::FailClose
    }
}

/// Source selected for a user's balance snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceSource {
    Auto,
    Exchange,
    Fixed,
}

impl Default for BalanceSource {
    fn default() -> Self {
        Self::Auto
    }
}
