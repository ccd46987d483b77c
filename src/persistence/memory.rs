// =============================================================================
// MemoryStore — in-process `Store` implementation for tests and dry-run
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;

use crate::domain::connection::Connection;
use crate::domain::order::Order;
use crate::domain::position::Position;
use crate::domain::risk_config::RiskMetrics;
use crate::domain::strategy::StrategyInstance;
use crate::domain::trade::Trade;
use crate::domain::user::User;
use crate::error::EngineError;

use super::{AuditLogEntry, Store};

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    connections: HashMap<String, Connection>,
    strategies: HashMap<String, StrategyInstance>,
    orders: HashMap<String, Order>,
    trades: Vec<Trade>,
    positions: HashMap<(String, String), Position>,
    risk_metrics: HashMap<(String, NaiveDate), RiskMetrics>,
    audit_log: Vec<AuditLogEntry>,
}

/// Every table lives behind its own lock so unrelated queries never contend.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, EngineError> {
        Ok(self.tables.read().users.get(user_id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, EngineError> {
        Ok(self
            .tables
            .read()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn put_user(&self, user: User) -> Result<(), EngineError> {
        self.tables.write().users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<Connection>, EngineError> {
        Ok(self.tables.read().connections.get(connection_id).cloned())
    }

    async fn list_connections_for_user(&self, user_id: &str) -> Result<Vec<Connection>, EngineError> {
        Ok(self
            .tables
            .read()
            .connections
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn put_connection(&self, connection: Connection) -> Result<(), EngineError> {
        self.tables
            .write()
            .connections
            .insert(connection.id.clone(), connection);
        Ok(())
    }

    async fn get_strategy(&self, strategy_id: &str) -> Result<Option<StrategyInstance>, EngineError> {
        Ok(self.tables.read().strategies.get(strategy_id).cloned())
    }

    async fn list_strategies_for_user(&self, user_id: &str) -> Result<Vec<StrategyInstance>, EngineError> {
        Ok(self
            .tables
            .read()
            .strategies
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_active_strategies(&self) -> Result<Vec<StrategyInstance>, EngineError> {
        Ok(self
            .tables
            .read()
            .strategies
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect())
    }

    async fn put_strategy(&self, strategy: StrategyInstance) -> Result<(), EngineError> {
        self.tables
            .write()
            .strategies
            .insert(strategy.id.clone(), strategy);
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, EngineError> {
        Ok(self.tables.read().orders.get(order_id).cloned())
    }

    async fn list_orders_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Order>, EngineError> {
        let tables = self.tables.read();
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(limit);
        Ok(orders)
    }

    async fn put_order(&self, order: Order) -> Result<(), EngineError> {
        self.tables.write().orders.insert(order.order_id.clone(), order);
        Ok(())
    }

    async fn put_trade(&self, trade: Trade) -> Result<(), EngineError> {
        self.tables.write().trades.push(trade);
        Ok(())
    }

    async fn list_trades_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Trade>, EngineError> {
        let tables = self.tables.read();
        let mut trades: Vec<Trade> = tables
            .trades
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.ts.cmp(&a.ts));
        trades.truncate(limit);
        Ok(trades)
    }

    async fn get_position(&self, user_id: &str, symbol: &str) -> Result<Option<Position>, EngineError> {
        Ok(self
            .tables
            .read()
            .positions
            .get(&(user_id.to_string(), symbol.to_string()))
            .cloned())
    }

    async fn list_positions_for_user(&self, user_id: &str) -> Result<Vec<Position>, EngineError> {
        Ok(self
            .tables
            .read()
            .positions
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert_position(&self, position: Position) -> Result<(), EngineError> {
        let key = (position.user_id.clone(), position.symbol.clone());
        self.tables.write().positions.insert(key, position);
        Ok(())
    }

    async fn get_risk_metrics(&self, user_id: &str, date: NaiveDate) -> Result<Option<RiskMetrics>, EngineError> {
        Ok(self
            .tables
            .read()
            .risk_metrics
            .get(&(user_id.to_string(), date))
            .cloned())
    }

    async fn upsert_risk_metrics(&self, metrics: RiskMetrics) -> Result<(), EngineError> {
        let key = (metrics.user_id.clone(), metrics.date);
        self.tables.write().risk_metrics.insert(key, metrics);
        Ok(())
    }

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), EngineError> {
        self.tables.write().audit_log.push(entry);
        Ok(())
    }
}
