// =============================================================================
// Gateway — the abstract exchange capability the engine depends on
// =============================================================================
//
// The engine never talks to a concrete exchange directly; every call goes
// through this trait, resolved per-connection by `gateway::pool::GatewayPool`.
// Concrete wire protocols are a thin, swappable concern (see `binance.rs`);
// `mock.rs` backs dry-run mode and tests.

pub mod binance;
pub mod mock;
pub mod pool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{MarketType, OrderType, PositionSide, Side, TimeInForce, WorkingType};
use crate::types::GatewayOrderStatus;

/// Full field set an exchange submit call may need, per the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub qty: f64,
    pub price: f64,
    pub stop_price: Option<f64>,
    pub tif: Option<TimeInForce>,
    pub iceberg_qty: Option<f64>,
    /// Always set to the originating `order.id` — the idempotence key
    /// exchange-side retries rely on.
    pub client_id: String,
    pub reduce_only: bool,
    pub position_side: Option<PositionSide>,
    pub market: MarketType,
    pub leverage: Option<u32>,
    pub working_type: Option<WorkingType>,
    pub price_protect: bool,
    pub activation_price: Option<f64>,
    pub callback_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub exchange_order_id: String,
    pub status: GatewayOrderStatus,
    pub client_id: String,
    /// Actual execution price, when the exchange (or simulator) reports one.
    /// `None` means the caller should fall back to the order's requested
    /// price — live gateways that only confirm acceptance, not a fill,
    /// leave this unset.
    #[serde(default)]
    pub fill_price: Option<f64>,
    /// Fee charged for this fill, in quote currency. `None` until a trade
    /// confirmation carries one.
    #[serde(default)]
    pub fee: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBalance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

/// Capability contract every concrete exchange client implements.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn submit_order(&self, req: OrderRequest) -> Result<OrderResult, EngineError>;
    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), EngineError>;
    async fn ping(&self) -> Result<(), EngineError>;

    async fn get_positions(&self) -> Result<Vec<RemotePosition>, EngineError> {
        Ok(Vec::new())
    }

    async fn get_balances(&self) -> Result<Vec<RemoteBalance>, EngineError> {
        Ok(Vec::new())
    }

    /// User data stream lifecycle — optional; gateways without a streaming
    /// API can leave these as no-ops.
    async fn create_listen_key(&self) -> Result<Option<String>, EngineError> {
        Ok(None)
    }

    async fn keep_alive_listen_key(&self, _listen_key: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close_listen_key(&self, _listen_key: &str) -> Result<(), EngineError> {
        Ok(())
    }
}
