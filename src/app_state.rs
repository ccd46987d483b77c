// =============================================================================
// Application State — shared handle over the engine's live subsystems
// =============================================================================
//
// `AppState` ties together the Arc-shared managers every background task
// already holds its own clone of, purely so the HTTP/WebSocket surface has
// one place to reach them from. It owns no engine logic of its own beyond
// the global trading-mode switch and a monotonically increasing version
// counter the WebSocket feed uses to detect changes worth pushing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::balance_manager::MultiUserBalanceManager;
use crate::domain::position::Position;
use crate::event_bus::Bus;
use crate::order_queue::OrderQueue;
use crate::persistence::Store;
use crate::price_cache::PriceCache;
use crate::risk_manager::MultiUserRiskManager;
use crate::runtime_config::RuntimeConfig;
use crate::state_manager::StateManager;
use crate::stop_loss_manager::StopLossManager;
use crate::strategy_engine::StrategyEngine;
use crate::types::TradingMode;

pub struct AppState {
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<RuntimeConfig>>,

    pub store: Arc<dyn Store>,
    pub bus: Arc<Bus>,
    pub prices: Arc<PriceCache>,
    pub state_manager: Arc<StateManager>,
    pub balances: Arc<MultiUserBalanceManager>,
    pub risk: Arc<MultiUserRiskManager>,
    pub stop_loss: Arc<StopLossManager>,
    pub strategies: Arc<StrategyEngine>,
    pub order_queue: Arc<OrderQueue>,

    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn Store>,
        bus: Arc<Bus>,
        prices: Arc<PriceCache>,
        state_manager: Arc<StateManager>,
        balances: Arc<MultiUserBalanceManager>,
        risk: Arc<MultiUserRiskManager>,
        stop_loss: Arc<StopLossManager>,
        strategies: Arc<StrategyEngine>,
        order_queue: Arc<OrderQueue>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config: Arc::new(RwLock::new(config)),
            store,
            bus,
            prices,
            state_manager,
            balances,
            risk,
            stop_loss,
            strategies,
            order_queue,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn trading_mode(&self) -> TradingMode {
        self.config.read().trading_mode
    }

    /// Operator control: switch the global trading mode. Does not touch any
    /// individual strategy's `StrategyStatus` — pause/resume of a single
    /// strategy is a separate, narrower operation on `StrategyEngine`.
    pub fn set_trading_mode(&self, mode: TradingMode) {
        self.config.write().trading_mode = mode;
        self.increment_version();
    }

    /// Build a snapshot of everything known about one user, for the REST
    /// status endpoint and the WebSocket push feed. Every nested lookup is
    /// scoped to `user_id` — no cross-user data ever lands in this struct.
    pub fn build_user_snapshot(&self, user_id: &str) -> UserSnapshot {
        let now = Utc::now();
        let balance = self.balances.get_or_create(user_id).get_snapshot();
        let positions = self.state_manager.positions(user_id);
        let (enqueued, dequeued, overflowed, dropped) = self.order_queue.counters_snapshot();

        UserSnapshot {
            user_id: user_id.to_string(),
            server_time: now,
            state_version: self.current_state_version(),
            trading_mode: self.trading_mode(),
            balance: BalanceView {
                total: balance.total,
                locked: balance.locked,
                available: balance.available,
            },
            positions,
            queue: QueueView {
                enqueued,
                dequeued,
                overflowed,
                dropped,
            },
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub total: f64,
    pub locked: f64,
    pub available: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueView {
    pub enqueued: u64,
    pub dequeued: u64,
    pub overflowed: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSnapshot {
    pub user_id: String,
    pub server_time: DateTime<Utc>,
    pub state_version: u64,
    pub trading_mode: TradingMode,
    pub balance: BalanceView,
    pub positions: Vec<Position>,
    pub queue: QueueView,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryStore;
    use crate::types::BalanceSource;

    fn build_state() -> AppState {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let bus = Arc::new(Bus::new());
        let prices = Arc::new(PriceCache::new());
        let state_manager = Arc::new(StateManager::new(store.clone()));
        let balances = Arc::new(MultiUserBalanceManager::new(1000.0, BalanceSource::Fixed));
        let risk = Arc::new(MultiUserRiskManager::new(Default::default()));
        let stop_loss = Arc::new(StopLossManager::new());
        let indicators = Arc::new(crate::indicators::engine::IndicatorEngine::new());
        let strategies = Arc::new(StrategyEngine::new(store.clone(), bus.clone(), indicators, prices.clone()));
        let order_queue = Arc::new(OrderQueue::new(
            crate::order_queue::DEFAULT_CAPACITY,
            crate::order_queue::DEFAULT_OVERFLOW_CAPACITY,
            None,
        ));

        AppState::new(
            RuntimeConfig::default(),
            store,
            bus,
            prices,
            state_manager,
            balances,
            risk,
            stop_loss,
            strategies,
            order_queue,
        )
    }

    #[test]
    fn set_trading_mode_updates_config_and_bumps_version() {
        let state = build_state();
        let before = state.current_state_version();
        state.set_trading_mode(TradingMode::Live);
        assert_eq!(state.trading_mode(), TradingMode::Live);
        assert!(state.current_state_version() > before);
    }

    #[test]
    fn build_user_snapshot_reflects_seeded_balance() {
        let state = build_state();
        let snapshot = state.build_user_snapshot("u1");
        assert_eq!(snapshot.balance.total, 1000.0);
        assert!(snapshot.positions.is_empty());
    }
}
