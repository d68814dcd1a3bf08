//! Admin / diagnostics HTTP API.
//!
//! Exposes cache state for local tooling. Frame pixels are never served.
//! - GET /health
//! - GET /metrics
//! - GET /v1/cache/stats
//! - GET, PATCH /v1/cache/config
//! - DELETE /v1/cache
//! - DELETE /v1/cache/compositions/{id}
//! - POST /v1/cache/compositions/{id}/invalidate
//! - POST /v1/cache/prefetch/abort

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::{CacheStats, FrameCache};
use crate::config::{CacheConfig, ConfigPatch};

/// Application state shared across handlers.
pub struct AppState {
    pub cache: FrameCache,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/cache", delete(clear_cache))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/config", get(get_config).patch(patch_config))
        .route("/v1/cache/compositions/{id}", delete(clear_composition))
        .route("/v1/cache/compositions/{id}/invalidate", post(invalidate))
        .route("/v1/cache/prefetch/abort", post(abort_prefetch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub pre_caching: bool,
    pub cache: CacheStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub state_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub cleared: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub removed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AbortResponse {
    pub aborted: bool,
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        pre_caching: state.cache.is_pre_caching(),
        cache: state.cache.stats(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.cache.metrics().render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<CacheConfig> {
    Json(state.cache.config())
}

async fn patch_config(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<ConfigPatch>,
) -> Json<CacheConfig> {
    let config = state.cache.set_config(&patch);
    info!(?patch, "Cache config updated");
    Json(config)
}

async fn clear_cache(State(state): State<Arc<AppState>>) -> Json<ClearResponse> {
    let removed = state.cache.stats().cached_frames;
    state.cache.clear();
    Json(ClearResponse { removed })
}

async fn clear_composition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<ClearResponse> {
    Json(ClearResponse {
        removed: state.cache.clear_composition(&id),
    })
}

async fn invalidate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<InvalidateRequest>,
) -> Json<InvalidateResponse> {
    Json(InvalidateResponse {
        cleared: state.cache.invalidate(&id, &req.state_hash),
    })
}

async fn abort_prefetch(State(state): State<Arc<AppState>>) -> Json<AbortResponse> {
    Json(AbortResponse {
        aborted: state.cache.abort_pre_cache(),
    })
}
