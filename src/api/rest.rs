// =============================================================================
// Operator REST endpoints
// =============================================================================
//
//   GET  /health                     liveness
//   GET  /status                     subsystem snapshot (breakers, proxies,
//                                    rate limits, queue depth, tiers)
//   GET  /positions                  open positions
//   POST /copy                       manual copy of a signal for one user
//   POST /proxies/:id/enable         put a disabled proxy back in rotation
//   POST /breakers/:service/reset    force a breaker CLOSED
//
// The user-facing trade/balance API lives in a separate service; these
// endpoints expose engine internals to operators only.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::app_state::AppState;
use crate::db::{positions, signals, whales};
use crate::engine::CopyOverrides;
use crate::events::EngineEvent;
use crate::types::{Exchange, TradeSide};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/positions", get(open_positions))
        .route("/copy", post(manual_copy))
        .route("/signals/dex", post(ingest_dex_swap))
        .route("/whales/:id/reseed", post(reseed_whale))
        .route("/proxies/:id/enable", post(enable_proxy))
        .route("/breakers/:service/reset", post(reset_breaker))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let breakers = state.breakers.all_stats().await;
    let mut rate_limits = Vec::new();
    for exchange in Exchange::all() {
        if let Ok(stats) = state.rate_limits.stats(exchange).await {
            rate_limits.push(stats);
        }
    }
    let queue_depth = state.queue.depth().await.unwrap_or(-1);
    let tiers = state.scheduler.tier_statistics().await.unwrap_or_default();

    Json(json!({
        "version": state.version(),
        "uptime_seconds": state.uptime_seconds(),
        "proxy_pool": state.proxy_pool.stats(),
        "breakers": breakers,
        "rate_limits": rate_limits,
        "signal_queue_depth": queue_depth,
        "polling_tiers": tiers,
    }))
}

async fn open_positions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let mut conn = state
        .db
        .acquire()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let open = positions::all_open(&mut conn, 500)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "count": open.len(), "positions": open })))
}

#[derive(Debug, Deserialize)]
struct ManualCopyRequest {
    signal_id: i64,
    user_id: i64,
    size_usdt: Option<Decimal>,
    exchange: Option<String>,
}

async fn manual_copy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ManualCopyRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let exchange = match &request.exchange {
        Some(raw) => Some(
            Exchange::parse(raw)
                .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown exchange {raw}")))?,
        ),
        None => None,
    };

    info!(
        signal_id = request.signal_id,
        user_id = request.user_id,
        "manual copy requested"
    );
    let result = state
        .engine
        .manual_copy(
            request.signal_id,
            request.user_id,
            CopyOverrides {
                size_usdt: request.size_usdt,
                exchange,
            },
        )
        .await
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    state.increment_version();
    Ok(Json(json!({ "result": result })))
}

/// Inbound interface for the external DEX transaction parser: a parsed swap
/// by a tracked wallet, already mapped to a CEX symbol where one exists.
#[derive(Debug, Deserialize)]
struct DexSwapRequest {
    whale_id: i64,
    tx_hash: String,
    cex_symbol: Option<String>,
    side: String,
    amount_usd: Decimal,
    price: Decimal,
}

async fn ingest_dex_swap(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DexSwapRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let side = TradeSide::parse(&request.side)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown side {}", request.side)))?;

    let mut conn = state
        .db
        .acquire()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let whale = whales::get(&mut conn, request.whale_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "whale not found".to_string()))?;

    let new_signal = state
        .detector
        .process_dex_swap(
            &whale,
            &request.tx_hash,
            request.cex_symbol,
            side,
            request.amount_usd,
            request.price,
        )
        .await;

    match new_signal {
        Some(new_signal) => {
            let signal_id = signals::insert(&mut conn, &new_signal)
                .await
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            state.events.publish(EngineEvent::SignalDetected {
                at: chrono::Utc::now(),
                signal_id,
                whale_id: new_signal.whale_id,
                symbol: new_signal.symbol.clone(),
                side: new_signal.side,
                size_usd: new_signal.size_usd,
                priority: new_signal.priority,
                is_close: new_signal.is_close,
            });
            state.increment_version();
            Ok(Json(json!({ "signal_id": signal_id })))
        }
        None => Ok(Json(json!({ "signal_id": null, "skipped": true }))),
    }
}

/// Drop a whale's in-memory snapshot so the next poll re-seeds the baseline.
async fn reseed_whale(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Json<Value> {
    state.detector.forget_whale(id);
    Json(json!({ "reseeded": id }))
}

async fn enable_proxy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> Result<Json<Value>, StatusCode> {
    if state.proxy_pool.re_enable(id) {
        state.increment_version();
        Ok(Json(json!({ "enabled": id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let breaker = state.breakers.breaker(&service);
    breaker
        .reset()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state.increment_version();
    Ok(Json(json!({ "reset": service })))
}
