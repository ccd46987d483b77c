// =============================================================================
// Nexus Trading Engine — Main Entry Point
// =============================================================================
//
// Wires every subsystem described in the design (event bus, price cache,
// strategy dispatcher, risk/balance managers, durable order queue, async
// executor, gateway pool, state manager, reconciliation) into one running
// process and starts the thin HTTP/WebSocket introspection surface over it.
//
// The engine starts Paused. An operator must explicitly resume trading via
// `POST /api/v1/control/resume`.
// =============================================================================

mod api;
mod app_state;
mod async_executor;
mod balance_manager;
mod crypto;
mod domain;
mod error;
mod event_bus;
mod executor;
mod fill_consumer;
mod gateway;
mod indicators;
mod market_feed;
mod order_queue;
mod persistence;
mod pipeline;
mod price_cache;
mod profit_target;
mod reconcile;
mod risk_manager;
mod runtime_config;
mod state_manager;
mod stop_loss_manager;
mod strategy_engine;
mod types;
mod wal;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::async_executor::AsyncExecutor;
use crate::balance_manager::MultiUserBalanceManager;
use crate::crypto::KeyManager;
use crate::domain::connection::{Connection, ExchangeType};
use crate::domain::strategy::StrategyInstance;
use crate::domain::user::User;
use crate::event_bus::Bus;
use crate::executor::Executor;
use crate::fill_consumer::FillConsumer;
use crate::gateway::pool::{GatewayPool, GatewayPoolConfig};
use crate::indicators::engine::IndicatorEngine;
use crate::order_queue::OrderQueue;
use crate::persistence::memory::MemoryStore;
use crate::persistence::Store;
use crate::pipeline::Pipeline;
use crate::price_cache::PriceCache;
use crate::profit_target::ProfitTargetTracker;
use crate::reconcile::Reconciler;
use crate::risk_manager::MultiUserRiskManager;
use crate::runtime_config::RuntimeConfig;
use crate::state_manager::StateManager;
use crate::stop_loss_manager::StopLossManager;
use crate::strategy_engine::StrategyEngine;
use crate::types::{ProfitTargetType, StrategyStatus, TradingMode};
use crate::wal::Wal;

const CONFIG_PATH: &str = "runtime_config.json";
/// Strategy dispatch channel depth — bursts beyond this drop ticks rather
/// than backing up the feed (see `market_feed::intake`).
const DISPATCH_CHANNEL_CAPACITY: usize = 256;
const DEMO_USER_ID: &str = "demo-user";
const DEMO_CONNECTION_ID: &str = "demo-connection";
const DEMO_STRATEGY_ID: &str = "demo-strategy";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("==================================================");
    info!("  Nexus Trading Engine — starting up");
    info!("==================================================");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: always boot paused; an operator must explicitly resume.
    config.trading_mode = TradingMode::Paused;

    let symbols: Vec<String> = std::env::var("NEXUS_SYMBOLS")
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .filter(|s: &Vec<String>| !s.is_empty())
        .unwrap_or_else(|| vec!["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()]);

    info!(
        symbols = ?symbols,
        trading_mode = %config.trading_mode,
        dry_run = config.effective_dry_run(),
        "engine configuration resolved"
    );

    // ── Key manager ──────────────────────────────────────────────────────
    // A master key is required whenever any connection is encrypted at
    // rest. In dry-run mode with no real connections configured we still
    // need one to construct the gateway pool — generate an ephemeral key
    // and say so loudly, since nothing encrypted under it survives restart.
    let master_key_material = config
        .master_encryption_key
        .clone()
        .or_else(|| std::env::var("MASTER_ENCRYPTION_KEY").ok());
    let key_manager = Arc::new(build_key_manager(master_key_material)?);

    // ── Persistence store ────────────────────────────────────────────────
    // A durable external store is an out-of-scope collaborator (spec §6.1);
    // `MemoryStore` implements the full `Store` contract and backs both
    // tests and this dry-run-oriented binary.
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    if config.effective_dry_run() {
        seed_demo_data(&store, &key_manager, &symbols).await?;
    }

    // ── Core shared state ────────────────────────────────────────────────
    let bus = Arc::new(Bus::new());
    let prices = Arc::new(PriceCache::new());
    let indicators = Arc::new(IndicatorEngine::new());
    let state_manager = Arc::new(StateManager::new(store.clone()));

    let balance_source = config.balance_source;
    let balances = Arc::new(MultiUserBalanceManager::new(config.dry_run_initial_balance, balance_source));
    let risk = Arc::new(MultiUserRiskManager::new(config.risk.clone()));
    let stop_loss = Arc::new(StopLossManager::new());

    let strategies = Arc::new(StrategyEngine::new(store.clone(), bus.clone(), indicators.clone(), prices.clone()));
    strategies.load_from_store().await?;

    // Positions must be warmed from the store before any fill is processed;
    // the store only supports per-user listing, so derive the active user
    // set from the strategies we just loaded.
    let active_user_ids = distinct_user_ids(&store).await?;
    state_manager.load(&active_user_ids).await?;

    // ── Durable order queue ──────────────────────────────────────────────
    let wal = if config.enable_order_wal {
        Some(Arc::new(Wal::open(&config.order_wal_path)?))
    } else {
        None
    };
    let order_queue = Arc::new(OrderQueue::new(
        order_queue::DEFAULT_CAPACITY,
        order_queue::DEFAULT_OVERFLOW_CAPACITY,
        wal.clone(),
    ));
    if let Some(wal) = &wal {
        recover_order_queue(wal, &order_queue)?;
    }

    // ── Gateway pool ─────────────────────────────────────────────────────
    let gateway_pool_config = GatewayPoolConfig {
        max_size: config.gateway_pool_max_size,
        idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        health_interval: Duration::from_secs(config.health_interval_secs),
        dry_run_slippage_bps: config.dry_run_slippage_bps,
        dry_run_fee_rate: config.dry_run_fee_rate,
        dry_run_latency_min_ms: config.dry_run_gateway_latency_min_ms,
        dry_run_latency_max_ms: config.dry_run_gateway_latency_max_ms,
        ..GatewayPoolConfig::default()
    };
    let gateway_pool = Arc::new(GatewayPool::new(store.clone(), key_manager.clone(), gateway_pool_config));
    gateway_pool.start();

    // ── Executor + async adapter ─────────────────────────────────────────
    let fallback_connection_id = if config.effective_dry_run() {
        Some(DEMO_CONNECTION_ID.to_string())
    } else {
        None
    };
    let executor = Arc::new(Executor::new(
        store.clone(),
        bus.clone(),
        gateway_pool.clone(),
        state_manager.clone(),
        balances.clone(),
        risk.clone(),
        stop_loss.clone(),
        prices.clone(),
        fallback_connection_id,
        config.effective_dry_run(),
    ));
    let async_executor = Arc::new(AsyncExecutor::new(
        executor,
        async_executor::DEFAULT_WORKER_SLOTS,
        async_executor::DEFAULT_RESULT_CAPACITY,
    ));
    spawn_execution_result_monitor(async_executor.clone());

    // ── Fill → position/balance/risk consumer ────────────────────────────
    let profit_target = Arc::new(ProfitTargetTracker::new(store.clone(), bus.clone()));
    let fill_consumer = Arc::new(FillConsumer::new(
        store.clone(),
        state_manager.clone(),
        balances.clone(),
        risk.clone(),
        stop_loss.clone(),
        prices.clone(),
        profit_target,
    ));

    // ── Signal → order pipeline ──────────────────────────────────────────
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        bus.clone(),
        risk.clone(),
        balances.clone(),
        state_manager.clone(),
        stop_loss.clone(),
        prices.clone(),
        order_queue.clone(),
        &config.risk,
    ));

    // ── Background task lifecycle ────────────────────────────────────────
    let cancel = CancellationToken::new();
    risk.start();
    balances.start();
    fill_consumer.spawn(bus.clone(), cancel.clone());
    pipeline.clone().start(cancel.clone());
    pipeline::spawn_queue_drain(order_queue.clone(), async_executor.clone(), cancel.clone());

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        bus.clone(),
        gateway_pool.clone(),
        state_manager.clone(),
        Duration::from_secs(config.reconcile_interval_secs),
    ));
    reconciler.start(cancel.clone());

    // ── Strategy dispatch loop ───────────────────────────────────────────
    let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);
    strategies.clone().start(dispatch_rx, cancel.clone());

    // No live exchange feed is wired in this binary (wire protocols are an
    // out-of-scope collaborator) — a synthetic feed exercises the pipeline
    // end to end in dry-run mode.
    if config.effective_dry_run() {
        let starting_prices = vec![100.0; symbols.len()];
        market_feed::run_demo_feed(
            symbols.clone(),
            starting_prices,
            bus.clone(),
            dispatch_tx,
            Duration::from_secs(1),
            cancel.clone(),
        );
        info!("demo synthetic price feed started (dry-run mode)");
    } else {
        drop(dispatch_tx);
        warn!("no live market data source wired; strategies will not receive ticks");
    }

    // ── HTTP/WebSocket surface ───────────────────────────────────────────
    let app_state = Arc::new(AppState::new(
        config.clone(),
        store.clone(),
        bus.clone(),
        prices.clone(),
        state_manager.clone(),
        balances.clone(),
        risk.clone(),
        stop_loss.clone(),
        strategies.clone(),
        order_queue.clone(),
    ));

    let bind_addr = std::env::var("NEXUS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let http_state = app_state.clone();
    let http_bind_addr = bind_addr.clone();
    tokio::spawn(async move {
        let router = api::rest::router(http_state);
        let listener = tokio::net::TcpListener::bind(&http_bind_addr)
            .await
            .expect("failed to bind API listener");
        info!(addr = %http_bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "API server exited");
        }
    });

    info!("all subsystems running — trading mode is Paused; resume via POST /api/v1/control/resume");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    cancel.cancel();
    async_executor.close().await;
    gateway_pool.stop();

    if let Err(e) = app_state.config.read().save(CONFIG_PATH) {
        warn!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Nexus Trading Engine shut down complete");
    Ok(())
}

fn build_key_manager(master_key_material: Option<String>) -> anyhow::Result<KeyManager> {
    match master_key_material {
        Some(material) => {
            let key_bytes = derive_32_byte_key(&material);
            Ok(KeyManager::new(1, &key_bytes)?)
        }
        None => {
            warn!("no MASTER_ENCRYPTION_KEY configured — generating an ephemeral key for this process only; encrypted credentials will not survive a restart");
            use rand::RngCore;
            let mut key_bytes = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key_bytes);
            Ok(KeyManager::new(1, &key_bytes)?)
        }
    }
}

/// Stretch arbitrary-length configured key material to the 32 bytes
/// AES-256-GCM requires, via SHA-256 (a KDF is out of scope here — operators
/// are expected to supply high-entropy key material directly).
fn derive_32_byte_key(material: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hasher.finalize().into()
}

async fn distinct_user_ids(store: &Arc<dyn Store>) -> anyhow::Result<Vec<String>> {
    let strategies = store.list_active_strategies().await?;
    let mut ids: Vec<String> = strategies.into_iter().map(|s| s.user_id).collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}

fn recover_order_queue(wal: &Arc<Wal>, order_queue: &Arc<OrderQueue>) -> anyhow::Result<()> {
    let result = wal.recover()?;
    let pending_count = result.pending.len();
    order_queue.requeue_recovered(result.pending);
    if pending_count > 0 || result.completed_count > wal::COMPACTION_THRESHOLD {
        info!(
            pending = pending_count,
            completed = result.completed_count,
            "recovered pending orders from WAL"
        );
    }
    Ok(())
}

fn spawn_execution_result_monitor(async_executor: Arc<AsyncExecutor>) {
    let Some(mut results) = async_executor.take_results() else {
        return;
    };
    tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            if result.success {
                info!(order_id = result.order_id, latency_ms = result.latency.as_millis() as u64, "order execution completed");
            } else {
                warn!(
                    order_id = result.order_id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "order execution failed"
                );
            }
        }
    });
}

/// Populate one demo user/connection/strategy so the dry-run binary has
/// something to route through the pipeline. Only called when
/// `effective_dry_run()` is true; never touches a live exchange.
async fn seed_demo_data(store: &Arc<dyn Store>, keys: &Arc<KeyManager>, symbols: &[String]) -> anyhow::Result<()> {
    if store.get_user(DEMO_USER_ID).await?.is_some() {
        return Ok(());
    }

    let now = chrono::Utc::now();
    store
        .put_user(User {
            id: DEMO_USER_ID.to_string(),
            email: "demo@nexus.local".to_string(),
            password_hash: String::new(),
            created_at: now,
            deleted: false,
        })
        .await?;

    store
        .put_connection(Connection {
            id: DEMO_CONNECTION_ID.to_string(),
            user_id: DEMO_USER_ID.to_string(),
            exchange_type: ExchangeType::Mock,
            encrypted_api_key: keys.encrypt("demo-key")?,
            encrypted_api_secret: keys.encrypt("demo-secret")?,
            key_version: keys.current_version(),
            active: true,
            name: "demo-mock".to_string(),
            created_at: now,
        })
        .await?;

    if let Some(symbol) = symbols.first() {
        store
            .put_strategy(StrategyInstance {
                id: DEMO_STRATEGY_ID.to_string(),
                user_id: DEMO_USER_ID.to_string(),
                connection_id: Some(DEMO_CONNECTION_ID.to_string()),
                strategy_type: "unregistered-demo".to_string(),
                symbol: symbol.clone(),
                interval: "1m".to_string(),
                params: Default::default(),
                status: StrategyStatus::Active,
                profit_target: 0.0,
                profit_target_type: ProfitTargetType::Absolute,
                initial_capital: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
    }

    info!(user_id = DEMO_USER_ID, "seeded demo user/connection/strategy for dry-run mode");
    Ok(())
}
