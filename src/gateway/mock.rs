// =============================================================================
// MockGateway — deterministic fill simulator backing dry-run and tests
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::GatewayOrderStatus;

use super::{Gateway, OrderRequest, OrderResult};

/// Always fills, applying a slippage and fee model, so dry-run balance and
/// position math exercises the same arithmetic as a live fill would.
/// Slippage always moves the fill price against the trader: up for buys,
/// down for sells.
pub struct MockGateway {
    pub slippage_bps: f64,
    pub fee_rate: f64,
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    healthy: Mutex<bool>,
}

impl MockGateway {
    pub fn new(slippage_bps: f64, fee_rate: f64, latency_min_ms: u64, latency_max_ms: u64) -> Self {
        Self {
            slippage_bps,
            fee_rate,
            latency_min_ms,
            latency_max_ms: latency_max_ms.max(latency_min_ms),
            healthy: Mutex::new(true),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    fn sampled_latency_ms(&self) -> u64 {
        if self.latency_max_ms == self.latency_min_ms {
            self.latency_min_ms
        } else {
            rand::thread_rng().gen_range(self.latency_min_ms..=self.latency_max_ms)
        }
    }

    fn simulate_fill(&self, req: &OrderRequest) -> (f64, f64) {
        let direction = match req.side {
            crate::types::Side::Buy => 1.0,
            crate::types::Side::Sell => -1.0,
        };
        let fill_price = req.price * (1.0 + direction * self.slippage_bps / 10_000.0);
        let fee = req.qty * fill_price * self.fee_rate;
        (fill_price, fee)
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0, 0)
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn submit_order(&self, req: OrderRequest) -> Result<OrderResult, EngineError> {
        let latency_ms = self.sampled_latency_ms();
        if latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency_ms)).await;
        }
        let (fill_price, fee) = self.simulate_fill(&req);
        Ok(OrderResult {
            exchange_order_id: format!("mock-{}", Uuid::new_v4()),
            status: GatewayOrderStatus::Filled,
            client_id: req.client_id,
            fill_price: Some(fill_price),
            fee: Some(fee),
        })
    }

    async fn cancel_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        if *self.healthy.lock() {
            Ok(())
        } else {
            Err(EngineError::ExchangeError {
                message: "mock gateway marked unhealthy".into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, OrderType, Side};

    fn sample_request() -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: 1.0,
            price: 100.0,
            stop_price: None,
            tif: None,
            iceberg_qty: None,
            client_id: "order-1".into(),
            reduce_only: false,
            position_side: None,
            market: MarketType::Spot,
            leverage: None,
            working_type: None,
            price_protect: false,
            activation_price: None,
            callback_rate: None,
        }
    }

    #[tokio::test]
    async fn submit_order_always_fills() {
        let gw = MockGateway::default();
        let result = gw.submit_order(sample_request()).await.unwrap();
        assert_eq!(result.status, GatewayOrderStatus::Filled);
        assert_eq!(result.client_id, "order-1");
        assert_eq!(result.fill_price, Some(100.0));
        assert_eq!(result.fee, Some(0.0));
    }

    #[tokio::test]
    async fn slippage_moves_fill_price_against_the_trader() {
        let gw = MockGateway::new(10.0, 0.0004, 0, 0);
        let buy = gw.submit_order(sample_request()).await.unwrap();
        // 10 bps of 100.0 = 0.01, buys fill higher.
        assert!((buy.fill_price.unwrap() - 100.01).abs() < 1e-9);

        let mut sell_req = sample_request();
        sell_req.side = Side::Sell;
        let sell = gw.submit_order(sell_req).await.unwrap();
        assert!((sell.fill_price.unwrap() - 99.99).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fee_scales_with_fee_rate_and_fill_price() {
        let gw = MockGateway::new(0.0, 0.0004, 0, 0);
        let result = gw.submit_order(sample_request()).await.unwrap();
        assert!((result.fee.unwrap() - 0.04).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sampled_latency_stays_within_configured_range() {
        let gw = MockGateway::new(0.0, 0.0, 5, 15);
        for _ in 0..50 {
            let ms = gw.sampled_latency_ms();
            assert!((5..=15).contains(&ms), "{ms} out of range");
        }
    }

    #[tokio::test]
    async fn ping_reflects_health_flag() {
        let gw = MockGateway::default();
        gw.ping().await.unwrap();
        gw.set_healthy(false);
        assert!(gw.ping().await.is_err());
    }
}
