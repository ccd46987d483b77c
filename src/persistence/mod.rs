// =============================================================================
// Persistence — the typed record store capability the engine depends on
// =============================================================================
//
// `Store` is the seam between the engine and whatever database backs it in
// production. Every query that takes a `user_id` enforces ownership at the
// store boundary — callers never filter user-owned rows client-side. The
// in-memory `MemoryStore` (see `memory.rs`) implements the full contract for
// tests and dry-run deployments.

pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::connection::Connection;
use crate::domain::order::Order;
use crate::domain::position::Position;
use crate::domain::risk_config::RiskMetrics;
use crate::domain::strategy::StrategyInstance;
use crate::domain::trade::Trade;
use crate::domain::user::User;
use crate::error::EngineError;

/// An audit log entry; optional per the external-interfaces contract, kept
/// append-only.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub user_id: Option<String>,
    pub action: String,
    pub detail: String,
    pub ts: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- users --------------------------------------------------------
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, EngineError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, EngineError>;
    async fn put_user(&self, user: User) -> Result<(), EngineError>;

    // -- connections ----------------------------------------------------
    async fn get_connection(&self, connection_id: &str) -> Result<Option<Connection>, EngineError>;
    async fn list_connections_for_user(&self, user_id: &str) -> Result<Vec<Connection>, EngineError>;
    async fn put_connection(&self, connection: Connection) -> Result<(), EngineError>;

    // -- strategy instances ------------------------------------------------
    async fn get_strategy(&self, strategy_id: &str) -> Result<Option<StrategyInstance>, EngineError>;
    async fn list_strategies_for_user(&self, user_id: &str) -> Result<Vec<StrategyInstance>, EngineError>;
    async fn list_active_strategies(&self) -> Result<Vec<StrategyInstance>, EngineError>;
    async fn put_strategy(&self, strategy: StrategyInstance) -> Result<(), EngineError>;

    // -- orders -----------------------------------------------------------
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, EngineError>;
    async fn list_orders_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Order>, EngineError>;
    async fn put_order(&self, order: Order) -> Result<(), EngineError>;

    // -- trades -----------------------------------------------------------
    async fn put_trade(&self, trade: Trade) -> Result<(), EngineError>;
    async fn list_trades_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Trade>, EngineError>;

    // -- positions (authoritative, per user+symbol) ------------------------
    async fn get_position(&self, user_id: &str, symbol: &str) -> Result<Option<Position>, EngineError>;
    async fn list_positions_for_user(&self, user_id: &str) -> Result<Vec<Position>, EngineError>;
    /// Atomic upsert keyed on `(user_id, symbol)`.
    async fn upsert_position(&self, position: Position) -> Result<(), EngineError>;

    // -- risk metrics -------------------------------------------------------
    async fn get_risk_metrics(&self, user_id: &str, date: NaiveDate) -> Result<Option<RiskMetrics>, EngineError>;
    /// Atomic upsert keyed on `(user_id, date)`.
    async fn upsert_risk_metrics(&self, metrics: RiskMetrics) -> Result<(), EngineError>;

    // -- audit log (optional, append-only) -----------------------------------
    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), EngineError>;
}
