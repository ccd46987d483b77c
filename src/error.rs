// =============================================================================
// Engine Error Taxonomy
// =============================================================================
//
// Every error kind a caller needs to branch on (not merely log) is a variant
// here. Transient/contextual errors that only need to be logged and wrapped
// keep using `anyhow::Result` with `.context(...)` at the call site, matching
// the pattern already used for exchange I/O (`gateway::binance`).
// =============================================================================

use thiserror::Error;

/// The engine-wide error taxonomy from the error-handling design.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: f64, available: f64 },

    #[error("risk rejected: {reason}")]
    RiskRejected { reason: String },

    #[error("connection {connection_id} not found for user {user_id}")]
    ConnectionNotFound {
        user_id: String,
        connection_id: String,
    },

    #[error("connection {connection_id} is not owned by user {user_id}")]
    OwnershipDenied {
        user_id: String,
        connection_id: String,
    },

    #[error("gateway for connection {connection_id} is unhealthy")]
    GatewayUnhealthy { connection_id: String },

    #[error("gateway call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("exchange error: {message}")]
    ExchangeError { message: String },

    #[error("encryption key version {version} unavailable")]
    KeyUnavailable { version: u32 },

    #[error("failed to decrypt credentials: {reason}")]
    DecryptFailed { reason: String },

    #[error("WAL write failed: {reason}")]
    WalWriteFailed { reason: String },

    #[error("order queue overflow: order {order_id} dropped")]
    QueueOverflow { order_id: String },

    #[error("strategy {strategy_id} panicked: {message}")]
    StrategyPanic {
        strategy_id: String,
        message: String,
    },

    #[error("persistence store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("strategy {strategy_id} not found")]
    StrategyNotFound { strategy_id: String },

    #[error("user {user_id} not found")]
    UserNotFound { user_id: String },
}

impl EngineError {
    /// A short machine-readable tag, used as the `reason` code attached to
    /// `RiskAlert`/`StrategyError` bus events and to rejected-order rows.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::RiskRejected { .. } => "RISK_REJECTED",
            Self::ConnectionNotFound { .. } => "CONNECTION_NOT_FOUND",
            Self::OwnershipDenied { .. } => "OWNERSHIP_DENIED",
            Self::GatewayUnhealthy { .. } => "GATEWAY_UNHEALTHY",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ExchangeError { .. } => "EXCHANGE_ERROR",
            Self::KeyUnavailable { .. } => "KEY_UNAVAILABLE",
            Self::DecryptFailed { .. } => "DECRYPT_FAILED",
            Self::WalWriteFailed { .. } => "WAL_WRITE_FAILED",
            Self::QueueOverflow { .. } => "QUEUE_OVERFLOW",
            Self::StrategyPanic { .. } => "STRATEGY_PANIC",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::StrategyNotFound { .. } => "STRATEGY_NOT_FOUND",
            Self::UserNotFound { .. } => "USER_NOT_FOUND",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_per_variant() {
        let e = EngineError::InsufficientBalance {
            requested: 10.0,
            available: 5.0,
        };
        assert_eq!(e.code(), "INSUFFICIENT_BALANCE");
    }

    #[test]
    fn display_includes_context() {
        let e = EngineError::GatewayUnhealthy {
            connection_id: "conn-1".into(),
        };
        assert!(e.to_string().contains("conn-1"));
    }
}
