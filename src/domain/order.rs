// =============================================================================
// Order — a single order submitted (or about to be submitted) to an exchange
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{MarketType, OrderStatus, OrderType, PositionSide, Side, TimeInForce};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub strategy_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub qty: f64,
    pub price: f64,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub tif: Option<TimeInForce>,
    pub market: MarketType,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub position_side: Option<PositionSide>,
    pub status: OrderStatus,
    /// Exchange-assigned id, populated once the gateway accepts the order.
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a new order in `NEW` status, ready for the queue.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        order_type: OrderType,
        qty: f64,
        price: f64,
        market: MarketType,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            connection_id: None,
            strategy_id: None,
            symbol: symbol.into(),
            side,
            order_type,
            qty,
            price,
            stop_price: None,
            tif: None,
            market,
            reduce_only: false,
            position_side: None,
            status: OrderStatus::New,
            exchange_order_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.qty > 0.0 && self.price >= 0.0 && !self.user_id.is_empty() && !self.symbol.is_empty()
    }

    pub fn transition(&mut self, status: OrderStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_order_starts_in_new_status() {
        let o = Order::new("u1", "BTCUSDT", Side::Buy, OrderType::Market, 1.0, 0.0, MarketType::Spot);
        assert_eq!(o.status, OrderStatus::New);
        assert!(o.is_valid());
    }

    #[test]
    fn zero_quantity_order_is_invalid() {
        let o = Order::new("u1", "BTCUSDT", Side::Buy, OrderType::Market, 0.0, 0.0, MarketType::Spot);
        assert!(!o.is_valid());
    }

    #[test]
    fn transition_bumps_updated_at_and_status() {
        let mut o = Order::new("u1", "BTCUSDT", Side::Buy, OrderType::Limit, 1.0, 100.0, MarketType::Spot);
        let created = o.created_at;
        o.transition(OrderStatus::Submitted);
        assert_eq!(o.status, OrderStatus::Submitted);
        assert!(o.updated_at >= created);
    }
}
