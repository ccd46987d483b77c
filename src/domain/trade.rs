// =============================================================================
// Trade — an executed fill, recorded once per gateway fill report
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    #[serde(default)]
    pub fee: f64,
    pub ts: DateTime<Utc>,
}

impl Trade {
    pub fn new(
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        price: f64,
        qty: f64,
        fee: f64,
    ) -> Self {
        Self {
            trade_id: Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            user_id: user_id.into(),
            symbol: symbol.into(),
            side,
            price,
            qty,
            fee,
            ts: Utc::now(),
        }
    }

    pub fn notional(&self) -> f64 {
        self.price * self.qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notional_is_price_times_qty() {
        let t = Trade::new("o1", "u1", "BTCUSDT", Side::Buy, 100.0, 2.0, 0.1);
        assert_eq!(t.notional(), 200.0);
    }
}
