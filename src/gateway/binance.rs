// =============================================================================
// BinanceGateway — thin `Gateway` adapter over signed Binance REST calls
// =============================================================================
//
// SECURITY: the secret key is held only in memory for the lifetime of the
// gateway entry and is never logged. Every signed request carries
// `X-MBX-APIKEY` as a header (never in the query string) and a recvWindow
// tolerant of minor clock drift.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::EngineError;
use crate::types::GatewayOrderStatus;

use super::{Gateway, OrderRequest, OrderResult};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

pub struct BinanceGateway {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceGateway {
    pub fn new(api_key: &str, secret: &str) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: secret.to_string(),
            base_url: "https://api.binance.com".to_string(),
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn order_type_str(order_type: crate::types::OrderType) -> &'static str {
        use crate::types::OrderType::*;
        match order_type {
            Market => "MARKET",
            Limit => "LIMIT",
            StopLoss => "STOP_LOSS",
            StopLossLimit => "STOP_LOSS_LIMIT",
            TakeProfit => "TAKE_PROFIT",
            TakeProfitLimit => "TAKE_PROFIT_LIMIT",
            LimitMaker => "LIMIT_MAKER",
            TrailingStopMarket => "TRAILING_STOP_MARKET",
        }
    }

    /// Binance's order-submit response carries per-fill entries under
    /// `fills` for orders that execute immediately. Returns the
    /// quantity-weighted average price and the summed commission, or
    /// `(None, None)` when the response carries no fills (unfilled limit
    /// orders, for instance).
    fn parse_fills(body: &serde_json::Value) -> (Option<f64>, Option<f64>) {
        let fills = match body["fills"].as_array() {
            Some(f) if !f.is_empty() => f,
            _ => return (None, None),
        };

        let mut notional = 0.0;
        let mut qty_sum = 0.0;
        let mut fee_sum = 0.0;
        for fill in fills {
            let price: f64 = fill["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let qty: f64 = fill["qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let commission: f64 = fill["commission"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            notional += price * qty;
            qty_sum += qty;
            fee_sum += commission;
        }

        if qty_sum <= 0.0 {
            return (None, None);
        }
        (Some(notional / qty_sum), Some(fee_sum))
    }

    fn parse_status(raw: &str) -> GatewayOrderStatus {
        match raw {
            "NEW" => GatewayOrderStatus::New,
            "PARTIALLY_FILLED" => GatewayOrderStatus::Partial,
            "FILLED" => GatewayOrderStatus::Filled,
            "CANCELED" | "PENDING_CANCEL" => GatewayOrderStatus::Canceled,
            "REJECTED" => GatewayOrderStatus::Rejected,
            "EXPIRED" => GatewayOrderStatus::Expired,
            _ => GatewayOrderStatus::Unknown,
        }
    }
}

#[async_trait]
impl Gateway for BinanceGateway {
    #[instrument(skip(self, req), name = "binance::submit_order", fields(symbol = %req.symbol))]
    async fn submit_order(&self, req: OrderRequest) -> Result<OrderResult, EngineError> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
            req.symbol,
            req.side,
            Self::order_type_str(req.order_type),
            req.qty,
            req.client_id,
        );
        if req.price > 0.0 {
            params.push_str(&format!("&price={}", req.price));
        }
        if let Some(sp) = req.stop_price {
            params.push_str(&format!("&stopPrice={sp}"));
        }
        if let Some(tif) = req.tif {
            let tif_str = match tif {
                crate::types::TimeInForce::Gtc => "GTC",
                crate::types::TimeInForce::Ioc => "IOC",
                crate::types::TimeInForce::Fok => "FOK",
                crate::types::TimeInForce::Gtx => "GTX",
            };
            params.push_str(&format!("&timeInForce={tif_str}"));
        }
        if req.reduce_only {
            params.push_str("&reduceOnly=true");
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.map_err(|e| EngineError::ExchangeError {
            message: format!("submit_order request failed: {e}"),
        })?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| EngineError::ExchangeError {
            message: format!("failed to parse order response: {e}"),
        })?;

        if !status.is_success() {
            warn!(%status, %body, "binance rejected order submission");
            return Err(EngineError::ExchangeError {
                message: format!("binance returned {status}: {body}"),
            });
        }

        let exchange_order_id = body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .unwrap_or_default();
        let raw_status = body["status"].as_str().unwrap_or("NEW");

        debug!(exchange_order_id, raw_status, "order submitted");

        let (fill_price, fee) = Self::parse_fills(&body);

        Ok(OrderResult {
            exchange_order_id,
            status: Self::parse_status(raw_status),
            client_id: req.client_id,
            fill_price,
            fee,
        })
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), EngineError> {
        let params = format!("symbol={symbol}&orderId={exchange_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self.client.delete(&url).send().await.map_err(|e| EngineError::ExchangeError {
            message: format!("cancel_order request failed: {e}"),
        })?;

        if !resp.status().is_success() {
            return Err(EngineError::ExchangeError {
                message: format!("binance cancel returned {}", resp.status()),
            });
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let url = format!("{}/api/v3/ping", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| EngineError::ExchangeError {
            message: format!("ping failed: {e}"),
        })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::ExchangeError {
                message: format!("ping returned {}", resp.status()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_for_same_inputs() {
        let gw = BinanceGateway::new("key", "secret");
        assert_eq!(gw.sign("a=1&b=2"), gw.sign("a=1&b=2"));
    }

    #[test]
    fn parse_status_maps_known_values() {
        assert_eq!(BinanceGateway::parse_status("FILLED"), GatewayOrderStatus::Filled);
        assert_eq!(BinanceGateway::parse_status("PARTIALLY_FILLED"), GatewayOrderStatus::Partial);
        assert_eq!(BinanceGateway::parse_status("bogus"), GatewayOrderStatus::Unknown);
    }

    #[test]
    fn order_type_mapping_matches_binance_vocabulary() {
        assert_eq!(BinanceGateway::order_type_str(crate::types::OrderType::Market), "MARKET");
        assert_eq!(BinanceGateway::order_type_str(crate::types::OrderType::StopLossLimit), "STOP_LOSS_LIMIT");
    }

    #[test]
    fn parse_fills_averages_price_and_sums_commission() {
        let body = serde_json::json!({
            "fills": [
                {"price": "50000.00", "qty": "0.5", "commission": "2.5"},
                {"price": "50010.00", "qty": "0.5", "commission": "2.5"},
            ]
        });
        let (price, fee) = BinanceGateway::parse_fills(&body);
        assert_eq!(price, Some(50005.0));
        assert_eq!(fee, Some(5.0));
    }

    #[test]
    fn parse_fills_absent_returns_none() {
        let body = serde_json::json!({"status": "NEW"});
        let (price, fee) = BinanceGateway::parse_fills(&body);
        assert_eq!(price, None);
        assert_eq!(fee, None);
    }
}
