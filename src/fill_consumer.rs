// =============================================================================
// Fill→Position Consumer — settles a filled order into position/balance/risk
// =============================================================================
//
// A dedicated task subscribed to `OrderFilled`. Every step here is one order
// id's worth of bookkeeping; nothing here talks to an exchange.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::balance_manager::MultiUserBalanceManager;
use crate::event_bus::{Bus, EngineEvent};
use crate::price_cache::PriceCache;
use crate::persistence::Store;
use crate::profit_target::ProfitTargetTracker;
use crate::risk_manager::MultiUserRiskManager;
use crate::state_manager::StateManager;
use crate::stop_loss_manager::StopLossManager;
use crate::types::Side;

/// Positions within this tolerance of zero are treated as flat for the
/// purpose of tearing down a strategy's stop-loss entry.
const FLAT_EPSILON: f64 = 1e-4;

pub struct FillConsumer {
    store: Arc<dyn Store>,
    state: Arc<StateManager>,
    balances: Arc<MultiUserBalanceManager>,
    risk: Arc<MultiUserRiskManager>,
    stop_loss: Arc<StopLossManager>,
    prices: Arc<PriceCache>,
    profit_target: Arc<ProfitTargetTracker>,
}

impl FillConsumer {
    pub fn new(
        store: Arc<dyn Store>,
        state: Arc<StateManager>,
        balances: Arc<MultiUserBalanceManager>,
        risk: Arc<MultiUserRiskManager>,
        stop_loss: Arc<StopLossManager>,
        prices: Arc<PriceCache>,
        profit_target: Arc<ProfitTargetTracker>,
    ) -> Self {
        Self {
            store,
            state,
            balances,
            risk,
            stop_loss,
            prices,
            profit_target,
        }
    }

    /// Spawn the consumer loop against `bus`, until `cancel` fires.
    pub fn spawn(self: Arc<Self>, bus: Arc<Bus>, cancel: CancellationToken) {
        let mut sub = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = sub.receiver.recv() => {
                        match event {
                            Some(EngineEvent::OrderFilled { order, fill_price, fill_qty }) => {
                                if let Err(e) = self.handle_fill(
                                    &order.user_id,
                                    order.strategy_id.as_deref(),
                                    &order.symbol,
                                    &order.order_id,
                                    order.side,
                                    fill_qty,
                                    fill_price,
                                ).await {
                                    error!(order_id = order.order_id, error = %e, "fill consumer failed");
                                }
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn handle_fill(
        &self,
        user_id: &str,
        strategy_id: Option<&str>,
        symbol: &str,
        order_id: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<(), crate::error::EngineError> {
        let price = self.resolve_fill_price(symbol, price);

        let (new_position, prev_position) = self.state.record_fill(user_id, symbol, side, qty, price).await?;

        let close_qty = qty.min(prev_position.qty.abs());
        let realized_pnl = if close_qty > 0.0 && prev_position.qty != 0.0 {
            let direction = if prev_position.qty > 0.0 { 1.0 } else { -1.0 };
            direction * close_qty * (price - prev_position.avg_entry_price)
        } else {
            0.0
        };

        let fees = self.sum_fees_for_order(user_id, order_id).await?;
        let net_pnl = realized_pnl - fees;

        let risk = self.risk.get_or_create(user_id);
        risk.update_metrics(net_pnl);

        let balance = self.balances.get_or_create(user_id);
        match side {
            Side::Buy => balance.deduct(qty * price),
            Side::Sell => balance.add(qty * price),
        }

        if let Some(strategy_id) = strategy_id {
            self.profit_target.record_and_check(strategy_id, net_pnl).await?;
        }

        if new_position.qty.abs() < FLAT_EPSILON {
            if let Some(strategy_id) = strategy_id {
                self.stop_loss.remove(strategy_id, symbol);
            }
        }

        Ok(())
    }

    fn resolve_fill_price(&self, symbol: &str, price: f64) -> f64 {
        if price > 0.0 {
            return price;
        }
        if let Some(cached) = self.prices.get(symbol).filter(|p| *p > 0.0) {
            warn!(symbol, "fill reported zero price, using cached price");
            return cached;
        }
        warn!(symbol, "fill and price cache both zero, guarding with 1.0");
        1.0
    }

    async fn sum_fees_for_order(&self, user_id: &str, order_id: &str) -> Result<f64, crate::error::EngineError> {
        let trades = self.store.list_trades_for_user(user_id, 500).await?;
        Ok(trades.iter().filter(|t| t.order_id == order_id).map(|t| t.fee).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::risk_config::RiskConfig;
    use crate::domain::stop_loss::StopLossPosition;
    use crate::domain::trade::Trade;
    use crate::persistence::memory::MemoryStore;
    use crate::types::BalanceSource;

    fn build_consumer() -> FillConsumer {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = Arc::new(StateManager::new(store.clone()));
        let balances = Arc::new(MultiUserBalanceManager::new(10_000.0, BalanceSource::Fixed));
        let risk = Arc::new(MultiUserRiskManager::new(RiskConfig::default()));
        let stop_loss = Arc::new(StopLossManager::new());
        let prices = Arc::new(PriceCache::new());
        let bus = Arc::new(Bus::new());
        let profit_target = Arc::new(ProfitTargetTracker::new(store.clone(), bus));
        FillConsumer::new(store, state, balances, risk, stop_loss, prices, profit_target)
    }

    #[tokio::test]
    async fn buy_fill_deducts_balance_and_opens_position() {
        let consumer = build_consumer();
        let bal = consumer.balances.get_or_create("u1");
        bal.lock(1000.0).unwrap();

        consumer
            .handle_fill("u1", None, "BTCUSDT", "o1", Side::Buy, 1.0, 100.0)
            .await
            .unwrap();

        let snap = bal.get_snapshot();
        assert_eq!(snap.total, 9_900.0);
        assert_eq!(snap.locked, 900.0);

        let pos = consumer.state.position("u1", "BTCUSDT");
        assert_eq!(pos.qty, 1.0);
    }

    #[tokio::test]
    async fn zero_price_fill_falls_back_to_price_cache() {
        let consumer = build_consumer();
        consumer.prices.set("BTCUSDT", 250.0);

        consumer
            .handle_fill("u1", None, "BTCUSDT", "o1", Side::Buy, 1.0, 0.0)
            .await
            .unwrap();

        let pos = consumer.state.position("u1", "BTCUSDT");
        assert_eq!(pos.avg_entry_price, 250.0);
    }

    #[tokio::test]
    async fn closing_fill_computes_realized_pnl_and_removes_stop_loss() {
        let consumer = build_consumer();
        consumer
            .handle_fill("u1", Some("s1"), "BTCUSDT", "o1", Side::Buy, 1.0, 100.0)
            .await
            .unwrap();
        consumer
            .stop_loss
            .add(StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 90.0, None));

        consumer
            .handle_fill("u1", Some("s1"), "BTCUSDT", "o2", Side::Sell, 1.0, 120.0)
            .await
            .unwrap();

        assert!(consumer.stop_loss.get("s1", "BTCUSDT").is_none());
        let metrics = consumer.risk.get_or_create("u1").metrics_snapshot();
        assert_eq!(metrics.daily_trades, 2);
    }

    #[tokio::test]
    async fn fees_are_subtracted_from_realized_pnl() {
        let consumer = build_consumer();
        consumer
            .handle_fill("u1", None, "BTCUSDT", "o1", Side::Buy, 1.0, 100.0)
            .await
            .unwrap();

        consumer
            .store
            .put_trade(Trade::new("o2", "u1", "BTCUSDT", Side::Sell, 120.0, 1.0, 5.0))
            .await
            .unwrap();

        consumer
            .handle_fill("u1", None, "BTCUSDT", "o2", Side::Sell, 1.0, 120.0)
            .await
            .unwrap();

        let metrics = consumer.risk.get_or_create("u1").metrics_snapshot();
        // realized 20 - fee 5 = 15 net pnl recorded for this trade.
        assert_eq!(metrics.daily_pnl, 15.0);
    }
}
