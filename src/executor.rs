// =============================================================================
// Executor — gateway routing, exchange submission, and persistence
// =============================================================================
//
// `handle` is the single place an `Order` crosses from in-memory intent to
// (optionally) a real exchange call and a durable row. Every step publishes
// its own event so subscribers can reconstruct the order's lifecycle without
// polling the store.

use std::sync::Arc;

use tracing::{info, warn};

use crate::balance_manager::MultiUserBalanceManager;
use crate::domain::order::Order;
use crate::domain::trade::Trade;
use crate::error::EngineError;
use crate::event_bus::{Bus, EngineEvent};
use crate::gateway::pool::GatewayPool;
use crate::gateway::OrderRequest;
use crate::persistence::Store;
use crate::price_cache::PriceCache;
use crate::risk_manager::MultiUserRiskManager;
use crate::state_manager::StateManager;
use crate::stop_loss_manager::StopLossManager;
use crate::types::{GatewayOrderStatus, OrderStatus};

pub struct Executor {
    store: Arc<dyn Store>,
    bus: Arc<Bus>,
    gateway_pool: Arc<GatewayPool>,
    state: Arc<StateManager>,
    balances: Arc<MultiUserBalanceManager>,
    risk: Arc<MultiUserRiskManager>,
    stop_loss: Arc<StopLossManager>,
    prices: Arc<PriceCache>,
    /// Global fallback gateway for single-connection/single-user deployments.
    fallback_connection_id: Option<String>,
    /// Dry-run wrapper: when true, the exchange call is skipped entirely and
    /// the order is persisted with status `NEW`.
    skip_exchange: bool,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<Bus>,
        gateway_pool: Arc<GatewayPool>,
        state: Arc<StateManager>,
        balances: Arc<MultiUserBalanceManager>,
        risk: Arc<MultiUserRiskManager>,
        stop_loss: Arc<StopLossManager>,
        prices: Arc<PriceCache>,
        fallback_connection_id: Option<String>,
        skip_exchange: bool,
    ) -> Self {
        Self {
            store,
            bus,
            gateway_pool,
            state,
            balances,
            risk,
            stop_loss,
            prices,
            fallback_connection_id,
            skip_exchange,
        }
    }

    pub async fn handle(&self, mut order: Order) -> Result<(), EngineError> {
        self.bus.publish(EngineEvent::OrderSubmitted { order: order.clone() });

        let connection_id = match self.resolve_connection_id(&order).await {
            Ok(Some(id)) => Some(id),
            Ok(None) if self.skip_exchange => None,
            Ok(None) => {
                order.transition(OrderStatus::Rejected);
                self.store.put_order(order.clone()).await?;
                self.bus.publish(EngineEvent::OrderRejected {
                    order_id: order.order_id.clone(),
                    reason: "NO_GATEWAY_RESOLVED".to_string(),
                });
                return Ok(());
            }
            Err(e) => {
                order.transition(OrderStatus::Rejected);
                self.store.put_order(order.clone()).await?;
                self.bus.publish(EngineEvent::OrderRejected {
                    order_id: order.order_id.clone(),
                    reason: e.code().to_string(),
                });
                return Ok(());
            }
        };

        if self.skip_exchange {
            // dry-run: leave status as-is (NEW) for the DB row.
            self.store.put_order(order.clone()).await?;
            self.bus.publish(EngineEvent::OrderUpdate { order: order.clone() });
            return Ok(());
        }

        let connection_id = connection_id.expect("resolved above when not skipping exchange");
        let gateway = self
            .gateway_pool
            .get_or_create(&order.user_id, &connection_id)
            .await?;

        let req = build_order_request(&order);
        let submit_result = gateway.submit_order(req).await;

        match submit_result {
            Err(e) => {
                order.transition(OrderStatus::Rejected);
                self.store.put_order(order.clone()).await?;
                self.bus.publish(EngineEvent::OrderRejected {
                    order_id: order.order_id.clone(),
                    reason: e.to_string(),
                });
                return Ok(());
            }
            Ok(result) => {
                let fill_price = result.fill_price.unwrap_or(order.price);
                let fee = result.fee.unwrap_or(0.0);

                order.exchange_order_id = Some(result.exchange_order_id.clone());
                order.price = fill_price;
                order.transition(status_from_gateway(result.status));
                self.bus.publish(EngineEvent::OrderAccepted { order: order.clone() });

                if matches!(result.status, GatewayOrderStatus::Filled) {
                    self.bus.publish(EngineEvent::OrderFilled {
                        order: order.clone(),
                        fill_price,
                        fill_qty: order.qty,
                    });
                    self.store.put_order(order.clone()).await?;
                    self.record_fill_side_effects(&order, fill_price, fee).await?;
                    self.bus.publish(EngineEvent::OrderUpdate { order });
                    return Ok(());
                }
            }
        }

        self.store.put_order(order.clone()).await?;
        self.bus.publish(EngineEvent::OrderUpdate { order });
        Ok(())
    }

    async fn record_fill_side_effects(
        &self,
        order: &Order,
        fill_price: f64,
        fee: f64,
    ) -> Result<(), EngineError> {
        let trade = Trade::new(
            order.order_id.clone(),
            order.user_id.clone(),
            order.symbol.clone(),
            order.side,
            fill_price,
            order.qty,
            fee,
        );
        self.store.put_trade(trade).await?;

        // The stop-loss/take-profit exit for this order was already
        // registered once, with the full decision (take_profit, trailing),
        // at signal time — see `pipeline.rs::handle_signal` step 6.
        // Re-registering here on every fill would overwrite that entry with
        // a bare stop-only default and silently disable take-profit/
        // trailing for the rest of the position's life.

        info!(order_id = order.order_id, "order filled and recorded");
        Ok(())
    }

    /// Priority: `connection_id` on the order; else the owning strategy's
    /// bound connection; else a global fallback (single-user mode).
    async fn resolve_connection_id(&self, order: &Order) -> Result<Option<String>, EngineError> {
        if let Some(id) = &order.connection_id {
            return Ok(Some(id.clone()));
        }

        if let Some(strategy_id) = &order.strategy_id {
            if let Some(strategy) = self.store.get_strategy(strategy_id).await? {
                if let Some(id) = strategy.connection_id {
                    return Ok(Some(id));
                }
            } else {
                warn!(strategy_id, "order references unknown strategy");
            }
        }

        Ok(self.fallback_connection_id.clone())
    }

    pub fn risk(&self) -> &Arc<MultiUserRiskManager> {
        &self.risk
    }

    pub fn balances(&self) -> &Arc<MultiUserBalanceManager> {
        &self.balances
    }

    pub fn prices(&self) -> &Arc<PriceCache> {
        &self.prices
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }
}

fn status_from_gateway(status: GatewayOrderStatus) -> OrderStatus {
    match status {
        GatewayOrderStatus::New => OrderStatus::Submitted,
        GatewayOrderStatus::Partial => OrderStatus::PartiallyFilled,
        GatewayOrderStatus::Filled => OrderStatus::Filled,
        GatewayOrderStatus::Canceled => OrderStatus::Canceled,
        GatewayOrderStatus::Rejected => OrderStatus::Rejected,
        GatewayOrderStatus::Expired => OrderStatus::Expired,
        GatewayOrderStatus::Unknown => OrderStatus::Submitted,
    }
}

fn build_order_request(order: &Order) -> OrderRequest {
    OrderRequest {
        symbol: order.symbol.clone(),
        side: order.side,
        order_type: order.order_type,
        qty: order.qty,
        price: order.price,
        stop_price: order.stop_price,
        tif: order.tif,
        iceberg_qty: None,
        client_id: order.order_id.clone(),
        reduce_only: order.reduce_only,
        position_side: order.position_side,
        market: order.market,
        leverage: None,
        working_type: None,
        price_protect: false,
        activation_price: None,
        callback_rate: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyManager;
    use crate::gateway::pool::GatewayPoolConfig;
    use crate::persistence::memory::MemoryStore;
    use crate::types::{BalanceSource, MarketType, OrderType, Side};

    fn build_executor(skip_exchange: bool) -> Executor {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let bus = Arc::new(Bus::new());
        let keys = Arc::new(KeyManager::new(1, &vec![4u8; 32]).unwrap());
        let pool = Arc::new(GatewayPool::new(store.clone(), keys, GatewayPoolConfig::default()));
        let state = Arc::new(StateManager::new(store.clone()));
        let balances = Arc::new(MultiUserBalanceManager::new(10_000.0, BalanceSource::Fixed));
        let risk = Arc::new(MultiUserRiskManager::new(Default::default()));
        let stop_loss = Arc::new(StopLossManager::new());
        let prices = Arc::new(PriceCache::new());

        Executor::new(store, bus, pool, state, balances, risk, stop_loss, prices, None, skip_exchange)
    }

    fn sample_order() -> Order {
        Order::new("u1", "BTCUSDT", Side::Buy, OrderType::Market, 1.0, 100.0, MarketType::Spot)
    }

    #[tokio::test]
    async fn dry_run_order_persists_as_new_without_gateway_call() {
        let executor = build_executor(true);
        let order = sample_order();
        let order_id = order.order_id.clone();
        executor.handle(order).await.unwrap();

        let persisted = executor.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, OrderStatus::New);
    }

    #[tokio::test]
    async fn unresolved_gateway_without_dry_run_is_rejected() {
        let executor = build_executor(false);
        let order = sample_order();
        let order_id = order.order_id.clone();
        executor.handle(order).await.unwrap();

        let persisted = executor.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, OrderStatus::Rejected);
    }

    #[test]
    fn status_from_gateway_maps_expected_variants() {
        assert_eq!(status_from_gateway(GatewayOrderStatus::Filled), OrderStatus::Filled);
        assert_eq!(status_from_gateway(GatewayOrderStatus::Rejected), OrderStatus::Rejected);
    }
}
