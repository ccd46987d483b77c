// =============================================================================
// Async Executor — bounded-concurrency adapter over `Executor::handle`
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

use crate::domain::order::Order;
use crate::error::EngineError;
use crate::executor::Executor;

pub const DEFAULT_WORKER_SLOTS: usize = 4;
pub const DEFAULT_RESULT_CAPACITY: usize = 100;
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub order_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub latency: Duration,
    pub ts: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    results_dropped: AtomicU64,
}

pub struct AsyncExecutor {
    executor: Arc<Executor>,
    semaphore: Arc<Semaphore>,
    worker_slots: usize,
    submit_timeout: Duration,
    results_tx: mpsc::Sender<ExecutionResult>,
    results_rx: parking_lot::Mutex<Option<mpsc::Receiver<ExecutionResult>>>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl AsyncExecutor {
    pub fn new(executor: Arc<Executor>, worker_slots: usize, result_capacity: usize) -> Self {
        Self::with_timeout(executor, worker_slots, result_capacity, DEFAULT_SUBMIT_TIMEOUT)
    }

    pub fn with_timeout(
        executor: Arc<Executor>,
        worker_slots: usize,
        result_capacity: usize,
        submit_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(result_capacity);
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(worker_slots)),
            worker_slots,
            submit_timeout,
            results_tx: tx,
            results_rx: parking_lot::Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn take_results(&self) -> Option<mpsc::Receiver<ExecutionResult>> {
        self.results_rx.lock().take()
    }

    /// Submit `order` for execution without blocking the caller beyond
    /// acquiring a worker slot. Spawns a task that calls `Executor::handle`,
    /// reports the result, and releases its slot.
    pub async fn execute_async(&self, order: Order) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::GatewayUnhealthy {
                connection_id: "async-executor-closed".to_string(),
            });
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed while executor is open");

        let executor = self.executor.clone();
        let results_tx = self.results_tx.clone();
        let counters = self.counters.clone();
        let timeout = self.submit_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            let start = Instant::now();
            let order_id = order.order_id.clone();
            let timeout_secs = timeout.as_secs();

            let outcome = match tokio::time::timeout(timeout, executor.handle(order)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::Timeout { timeout_secs }),
            };
            let result = ExecutionResult {
                order_id,
                success: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
                latency: start.elapsed(),
                ts: Utc::now(),
            };

            if let Err(mpsc::error::TrySendError::Full(_)) = results_tx.try_send(result) {
                counters.results_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("async executor result dropped: results channel full");
            }
        });

        Ok(())
    }

    /// Join every outstanding task: every spawned task holds one worker
    /// permit for its duration, so acquiring all of them back proves none
    /// are still running.
    pub async fn wait_all(&self) {
        let _ = self.semaphore.acquire_many(self.worker_slots as u32).await;
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wait_all().await;
    }

    pub fn results_dropped(&self) -> u64 {
        self.counters.results_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance_manager::MultiUserBalanceManager;
    use crate::event_bus::Bus;
    use crate::gateway::pool::{GatewayPool, GatewayPoolConfig};
    use crate::persistence::memory::MemoryStore;
    use crate::price_cache::PriceCache;
    use crate::risk_manager::MultiUserRiskManager;
    use crate::state_manager::StateManager;
    use crate::stop_loss_manager::StopLossManager;
    use crate::types::{BalanceSource, MarketType, OrderType, Side};
    use crate::crypto::KeyManager;

    fn build_executor() -> Arc<Executor> {
        let store: Arc<dyn crate::persistence::Store> = Arc::new(MemoryStore::new());
        let bus = Arc::new(Bus::new());
        let keys = Arc::new(KeyManager::new(1, &vec![1u8; 32]).unwrap());
        let pool = Arc::new(GatewayPool::new(store.clone(), keys, GatewayPoolConfig::default()));
        let state = Arc::new(StateManager::new(store.clone()));
        let balances = Arc::new(MultiUserBalanceManager::new(10_000.0, BalanceSource::Fixed));
        let risk = Arc::new(MultiUserRiskManager::new(Default::default()));
        let stop_loss = Arc::new(StopLossManager::new());
        let prices = Arc::new(PriceCache::new());

        Arc::new(Executor::new(
            store,
            bus,
            pool,
            state,
            balances,
            risk,
            stop_loss,
            prices,
            None,
            true, // dry-run: skip_exchange
        ))
    }

    fn sample_order() -> Order {
        Order::new("u1", "BTCUSDT", Side::Buy, OrderType::Market, 1.0, 100.0, MarketType::Spot)
    }

    #[tokio::test]
    async fn execute_async_reports_a_result() {
        let async_exec = AsyncExecutor::new(build_executor(), DEFAULT_WORKER_SLOTS, DEFAULT_RESULT_CAPACITY);
        let mut results = async_exec.take_results().unwrap();

        async_exec.execute_async(sample_order()).await.unwrap();
        let result = results.recv().await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn close_rejects_further_submissions() {
        let async_exec = AsyncExecutor::new(build_executor(), DEFAULT_WORKER_SLOTS, DEFAULT_RESULT_CAPACITY);
        async_exec.close().await;
        let err = async_exec.execute_async(sample_order()).await.unwrap_err();
        assert_eq!(err.code(), "GATEWAY_UNHEALTHY");
    }

    #[tokio::test]
    async fn submission_exceeding_timeout_reports_timeout_error() {
        use crate::domain::connection::{Connection, ExchangeType};
        use chrono::Utc;

        let store: Arc<dyn crate::persistence::Store> = Arc::new(MemoryStore::new());
        let bus = Arc::new(Bus::new());
        let keys = Arc::new(KeyManager::new(1, &vec![1u8; 32]).unwrap());
        let mut pool_config = GatewayPoolConfig::default();
        pool_config.dry_run_latency_min_ms = 50;
        pool_config.dry_run_latency_max_ms = 50;
        let pool = Arc::new(GatewayPool::new(store.clone(), keys.clone(), pool_config));

        store
            .put_connection(Connection {
                id: "conn-1".into(),
                user_id: "u1".into(),
                exchange_type: ExchangeType::Mock,
                encrypted_api_key: keys.encrypt("key").unwrap(),
                encrypted_api_secret: keys.encrypt("secret").unwrap(),
                key_version: 1,
                active: true,
                name: "test".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let state = Arc::new(StateManager::new(store.clone()));
        let balances = Arc::new(MultiUserBalanceManager::new(10_000.0, BalanceSource::Fixed));
        let risk = Arc::new(MultiUserRiskManager::new(Default::default()));
        let stop_loss = Arc::new(StopLossManager::new());
        let prices = Arc::new(PriceCache::new());

        let executor = Arc::new(Executor::new(
            store,
            bus,
            pool,
            state,
            balances,
            risk,
            stop_loss,
            prices,
            Some("conn-1".to_string()),
            false, // live path through the (mock) gateway, which sleeps 50ms
        ));

        let async_exec = AsyncExecutor::with_timeout(
            executor,
            DEFAULT_WORKER_SLOTS,
            DEFAULT_RESULT_CAPACITY,
            Duration::from_millis(1),
        );
        let mut results = async_exec.take_results().unwrap();

        async_exec.execute_async(sample_order()).await.unwrap();
        let result = results.recv().await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }
}
