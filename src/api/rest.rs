// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. Every other endpoint requires the single admin bearer
// token checked by the `AuthBearer` extractor (`NEXUS_ADMIN_TOKEN`) — this
// is a single-operator admin surface, not per-user authentication. The
// `user_id` path parameter picks which user's state to read or mutate; it
// is not itself a credential, and any caller holding the admin token can
// address any `user_id`.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::TradingMode;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated, per-user ─────────────────────────────────
        .route("/api/v1/users/:user_id/state", get(user_state))
        .route("/api/v1/users/:user_id/positions", get(positions))
        .route("/api/v1/users/:user_id/balance", get(balance))
        .route("/api/v1/users/:user_id/orders", get(orders))
        .route("/api/v1/users/:user_id/trades", get(trades))
        // ── Authenticated, global operator controls ─────────────────
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn user_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    Json(state.build_user_snapshot(&user_id))
}

async fn positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    Json(state.state_manager.positions(&user_id))
}

async fn balance(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let snapshot = state.balances.get_or_create(&user_id).get_snapshot();
    Json(snapshot)
}

async fn orders(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.store.list_orders_for_user(&user_id, 100).await {
        Ok(orders) => Ok(Json(orders)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
    }
}

async fn trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.store.list_trades_for_user(&user_id, 100).await {
        Ok(trades) => Ok(Json(trades)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
    }
}

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: TradingMode,
    message: String,
}

async fn control_pause(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Paused);
    info!("trading paused via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Paused,
        message: "trading paused".to_string(),
    })
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_trading_mode(TradingMode::Live);
    info!("trading resumed via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Live,
        message: "trading resumed".to_string(),
    })
}

#[derive(Deserialize)]
struct KillRequest {
    #[serde(default)]
    confirm: bool,
}

async fn control_kill(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    body: Option<Json<KillRequest>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let confirm = body.map(|Json(req)| req.confirm).unwrap_or(false);
    if !confirm {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "killing trading requires confirm: true" })),
        ));
    }

    state.set_trading_mode(TradingMode::Killed);
    warn!("trading KILLED via API");
    Ok(Json(ControlResponse {
        trading_mode: TradingMode::Killed,
        message: "trading killed — manual restart required".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance_manager::MultiUserBalanceManager;
    use crate::event_bus::Bus;
    use crate::order_queue::{OrderQueue, DEFAULT_CAPACITY, DEFAULT_OVERFLOW_CAPACITY};
    use crate::persistence::memory::MemoryStore;
    use crate::price_cache::PriceCache;
    use crate::risk_manager::MultiUserRiskManager;
    use crate::runtime_config::RuntimeConfig;
    use crate::state_manager::StateManager;
    use crate::stop_loss_manager::StopLossManager;
    use crate::strategy_engine::StrategyEngine;
    use crate::types::BalanceSource;

    fn build_state() -> Arc<AppState> {
        let store: Arc<dyn crate::persistence::Store> = Arc::new(MemoryStore::new());
        let bus = Arc::new(Bus::new());
        let prices = Arc::new(PriceCache::new());
        let state_manager = Arc::new(StateManager::new(store.clone()));
        let balances = Arc::new(MultiUserBalanceManager::new(1000.0, BalanceSource::Fixed));
        let risk = Arc::new(MultiUserRiskManager::new(Default::default()));
        let stop_loss = Arc::new(StopLossManager::new());
        let indicators = Arc::new(crate::indicators::engine::IndicatorEngine::new());
        let strategies = Arc::new(StrategyEngine::new(store.clone(), bus.clone(), indicators, prices.clone()));
        let order_queue = Arc::new(OrderQueue::new(DEFAULT_CAPACITY, DEFAULT_OVERFLOW_CAPACITY, None));

        Arc::new(AppState::new(
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
        ))
    }

    #[test]
    fn router_builds_without_panicking() {
        let _ = router(build_state());
    }
}
