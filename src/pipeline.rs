// =============================================================================
// Pipeline — the Signal→Order control loop
// =============================================================================
//
// A single consumer task subscribed to `StrategySignal` owns this flow end to
// end: resolve the signal's owning user and connection, snapshot account
// state, run the risk evaluation, lock the notional, register the stop-loss
// exit, and enqueue the resulting order. A second consumer, subscribed to
// `PriceTick`, drives the stop-loss manager and turns its triggers into
// closing orders. Neither task ever holds a lock across an `.await` —
// snapshots are copied out before any suspension point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::async_executor::AsyncExecutor;
use crate::balance_manager::MultiUserBalanceManager;
use crate::domain::order::Order;
use crate::domain::risk_config::RiskConfig;
use crate::domain::stop_loss::{StopLossPosition, StopLossSide};
use crate::domain::strategy::Signal;
use crate::event_bus::{Bus, EngineEvent};
use crate::order_queue::OrderQueue;
use crate::persistence::Store;
use crate::price_cache::PriceCache;
use crate::risk_manager::{AccountSnapshot, MultiUserRiskManager};
use crate::state_manager::StateManager;
use crate::stop_loss_manager::StopLossManager;
use crate::types::{FailureMode, LimitLevel, MarketType, OrderType, Side};

/// How long an account's exposure snapshot is reused before recomputing —
/// §4.14 step 2 calls this out explicitly as a 1-second cache.
const EXPOSURE_CACHE_TTL: Duration = Duration::from_secs(1);

pub struct Pipeline {
    store: Arc<dyn Store>,
    bus: Arc<Bus>,
    risk: Arc<MultiUserRiskManager>,
    balances: Arc<MultiUserBalanceManager>,
    state: Arc<StateManager>,
    stop_loss: Arc<StopLossManager>,
    prices: Arc<PriceCache>,
    order_queue: Arc<OrderQueue>,
    failure_mode: FailureMode,
    use_trailing_stop: bool,
    default_trailing_pct: f64,
    exposure_cache: RwLock<HashMap<String, (Instant, f64)>>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<Bus>,
        risk: Arc<MultiUserRiskManager>,
        balances: Arc<MultiUserBalanceManager>,
        state: Arc<StateManager>,
        stop_loss: Arc<StopLossManager>,
        prices: Arc<PriceCache>,
        order_queue: Arc<OrderQueue>,
        risk_config: &RiskConfig,
    ) -> Self {
        Self {
            store,
            bus,
            risk,
            balances,
            state,
            stop_loss,
            prices,
            order_queue,
            failure_mode: risk_config.failure_mode,
            use_trailing_stop: risk_config.use_trailing_stop,
            default_trailing_pct: risk_config.trailing_percent,
            exposure_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn both consumer loops (signal→order and price-tick-driven exits).
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        let signal_self = self.clone();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            signal_self.run_signal_consumer(signal_cancel).await;
        });

        let tick_self = self.clone();
        tokio::spawn(async move {
            tick_self.run_price_tick_consumer(cancel).await;
        });
    }

    async fn run_signal_consumer(self: Arc<Self>, cancel: CancellationToken) {
        let mut sub = self.bus.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = sub.receiver.recv() => {
                    let Some(event) = event else { return };
                    if let EngineEvent::StrategySignal { strategy_id, signal } = event {
                        // Panic safety: an unwind here must not take the
                        // consumer down. No lock is held across this call.
                        if let Err(e) = std::panic::AssertUnwindSafe(
                            self.handle_signal(&strategy_id, signal),
                        )
                        .catch_unwind()
                        .await
                        {
                            error!(strategy_id, panic = ?e, "signal handler panicked");
                        }
                    }
                }
            }
        }
    }

    async fn run_price_tick_consumer(self: Arc<Self>, cancel: CancellationToken) {
        let mut sub = self.bus.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = sub.receiver.recv() => {
                    let Some(event) = event else { return };
                    if let EngineEvent::PriceTick { symbol, price } = event {
                        self.handle_price_tick(&symbol, price).await;
                    }
                }
            }
        }
    }

    fn deny(&self, user_id: Option<String>, reason: impl Into<String>) {
        self.bus.publish(EngineEvent::RiskAlert {
            user_id,
            kind: "RISK_REJECTED".to_string(),
            reason: reason.into(),
        });
    }

    async fn handle_signal(&self, strategy_id: &str, signal: Signal) {
        // Step 1: resolve the owning user from the strategy row. A store
        // failure here always denies — there is no risk tier yet to apply
        // FAIL_LIMIT's "deny only if already constrained" nuance to.
        let instance = match self.store.get_strategy(strategy_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.deny(None, "STRATEGY_NOT_FOUND");
                return;
            }
            Err(e) => {
                warn!(strategy_id, error = %e, "store unavailable while resolving strategy");
                self.deny(None, "STORE_UNAVAILABLE");
                return;
            }
        };
        let user_id = instance.user_id.clone();

        // Step 2: snapshot price, position, and exposure.
        let Some(price) = self.prices.get(&signal.symbol) else {
            self.deny(Some(user_id), "NO_PRICE");
            return;
        };
        let position = self.state.position(&user_id, &signal.symbol);
        let account = AccountSnapshot {
            total_exposure: self.exposure(&user_id),
            pending_notional: self.order_queue.pending_notional(),
        };

        // Step 3: risk evaluation.
        let risk = self.risk.get_or_create(&user_id);
        let decision = risk.evaluate_full(&signal, &position, &account, strategy_id);
        if !decision.allowed {
            self.deny(
                Some(user_id),
                decision.reason.unwrap_or_else(|| "RISK_REJECTED".to_string()),
            );
            return;
        }
        if let Some(warning) = &decision.warning {
            self.bus.publish(EngineEvent::RiskAlert {
                user_id: Some(user_id.clone()),
                kind: "RISK_WARNING".to_string(),
                reason: warning.clone(),
            });
        }

        // Step 1 (continued): resolve the connection, now that a risk tier
        // exists to apply FAIL_LIMIT against if the store call fails.
        let connection_id = match self
            .resolve_connection_id(&user_id, instance.connection_id.as_deref(), decision.limit_level)
            .await
        {
            Ok(id) => id,
            Err(reason) => {
                self.deny(Some(user_id), reason);
                return;
            }
        };

        // Step 4: final size/notional.
        let final_size = if decision.adjusted_size > 0.0 {
            decision.adjusted_size
        } else {
            signal.size
        };
        let final_notional = final_size * price;

        // Step 5: lock after evaluation, never before.
        let balance_mgr = self.balances.get_or_create(&user_id);
        if let Err(e) = balance_mgr.lock(final_notional) {
            warn!(user_id, error = %e, "balance lock failed");
            self.deny(Some(user_id), "InsufficientBalance");
            return;
        }

        // Step 6: register the stop-loss/take-profit exit.
        let stop_loss_level = decision.stop_loss.unwrap_or(price);
        let mut sl_position = StopLossPosition::new(
            strategy_id,
            signal.symbol.clone(),
            signal.side,
            price,
            stop_loss_level,
            decision.take_profit,
        );
        if self.use_trailing() {
            sl_position = sl_position.with_trailing(self.trailing_offset_pct());
        }
        self.stop_loss.add(sl_position);

        // Step 7: build and enqueue the order.
        let mut order = Order::new(
            user_id.clone(),
            signal.symbol.clone(),
            signal.side,
            OrderType::Market,
            final_size,
            price,
            MarketType::Spot,
        );
        order.connection_id = connection_id;
        order.strategy_id = Some(strategy_id.to_string());
        order.stop_price = decision.stop_loss;

        if let Err(e) = self.order_queue.enqueue(order) {
            balance_mgr.unlock(final_notional);
            warn!(strategy_id, error = %e, "order enqueue failed");
            self.deny(Some(user_id), e.code());
        }
    }

    /// Resolve and verify ownership of the strategy's bound connection, if
    /// any. `limit_level` is the already-computed risk tier, used only to
    /// decide FAIL_LIMIT's tolerance for a store failure here.
    async fn resolve_connection_id(
        &self,
        user_id: &str,
        connection_id: Option<&str>,
        limit_level: LimitLevel,
    ) -> Result<Option<String>, &'static str> {
        let Some(connection_id) = connection_id.filter(|c| !c.is_empty()) else {
            return Ok(None);
        };

        match self.store.get_connection(connection_id).await {
            Ok(Some(conn)) if conn.is_usable_by(user_id) => Ok(Some(conn.id)),
            Ok(Some(_)) => Err("OWNERSHIP_DENIED"),
            Ok(None) => Err("CONNECTION_NOT_FOUND"),
            Err(e) => {
                warn!(user_id, connection_id, error = %e, "store unavailable while verifying connection");
                match self.failure_mode {
                    FailureMode::FailClose => Err("STORE_UNAVAILABLE"),
                    FailureMode::FailLimit => {
                        if matches!(limit_level, LimitLevel::Caution | LimitLevel::Limit) {
                            Err("STORE_UNAVAILABLE")
                        } else {
                            // Below the risk tier FAIL_LIMIT is configured to
                            // guard — proceed without a verified connection;
                            // the executor falls back to its global gateway.
                            Ok(None)
                        }
                    }
                }
            }
        }
    }

    async fn handle_price_tick(&self, symbol: &str, price: f64) {
        let triggers = self.stop_loss.update_price(symbol, price);
        for (strategy_id, exit) in triggers {
            let Ok(Some(instance)) = self.store.get_strategy(&strategy_id).await else {
                warn!(strategy_id, "could not resolve owning user for triggered stop-loss, skipping close");
                continue;
            };
            let user_id = instance.user_id;
            let position = self.state.position(&user_id, symbol);
            if position.is_flat() {
                self.stop_loss.remove(&strategy_id, symbol);
                continue;
            }

            let side = match exit.side_to_close {
                StopLossSide::Buy => Side::Buy,
                StopLossSide::Sell => Side::Sell,
            };
            let mut order = Order::new(
                user_id.clone(),
                symbol.to_string(),
                side,
                OrderType::Market,
                position.qty.abs(),
                price,
                MarketType::Spot,
            );
            order.connection_id = instance.connection_id.clone();
            order.strategy_id = Some(strategy_id.clone());
            order.reduce_only = true;

            if let Err(e) = self.order_queue.enqueue(order) {
                warn!(strategy_id, error = %e, "failed to enqueue stop-loss close order");
            }

            self.bus.publish(EngineEvent::StopLossTriggered {
                strategy_id: strategy_id.clone(),
                symbol: symbol.to_string(),
                side_to_close: exit.side_to_close,
                reason: exit.reason.to_string(),
            });
            self.stop_loss.remove(&strategy_id, symbol);
        }
    }

    fn exposure(&self, user_id: &str) -> f64 {
        {
            let cache = self.exposure_cache.read();
            if let Some((ts, value)) = cache.get(user_id) {
                if ts.elapsed() < EXPOSURE_CACHE_TTL {
                    return *value;
                }
            }
        }

        let total: f64 = self
            .state
            .positions(user_id)
            .iter()
            .map(|p| (p.qty * self.prices.get(&p.symbol).unwrap_or(0.0)).abs())
            .sum();

        self.exposure_cache.write().insert(user_id.to_string(), (Instant::now(), total));
        total
    }

    fn use_trailing(&self) -> bool {
        // Trailing defaults are global (see `domain::risk_config::RiskConfig`);
        // per-strategy overrides only cover SL/TP percentages, not trailing.
        self.use_trailing_stop
    }

    fn trailing_offset_pct(&self) -> f64 {
        self.default_trailing_pct
    }
}

/// Drain the durable order queue and forward each order to the async
/// executor. Runs until `cancel` fires or the queue closes.
pub fn spawn_queue_drain(
    order_queue: Arc<OrderQueue>,
    async_executor: Arc<AsyncExecutor>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                maybe_order = order_queue.dequeue() => {
                    let Some(order) = maybe_order else { return };
                    let order_id = order.order_id.clone();
                    if let Err(e) = async_executor.execute_async(order).await {
                        error!(order_id, error = %e, "failed to submit order to async executor");
                        continue;
                    }
                    if let Err(e) = order_queue.mark_complete(&order_id) {
                        error!(order_id, error = %e, "failed to mark order complete in WAL");
                    }
                }
            }
        }
    });
}
