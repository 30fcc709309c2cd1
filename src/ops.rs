//! Operator surface: metrics, inspection, health, and manual
//! invalidation over HTTP.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};

use crate::metrics::HealthStatus;
use crate::swr::ContentCache;

/// Routes under `/cache/*` for operators.
pub fn ops_routes(cache: Arc<ContentCache>) -> Router {
    Router::new()
        .route("/cache/metrics", get(metrics))
        .route("/cache/metrics/reset", post(reset_metrics))
        .route("/cache/inspect", get(inspect))
        .route("/cache/health", get(health))
        .route("/cache/invalidate", post(invalidate))
        .route("/cache/clear", post(clear))
        .with_state(cache)
}

async fn metrics(State(cache): State<Arc<ContentCache>>) -> Response {
    Json(cache.snapshot()).into_response()
}

async fn reset_metrics(State(cache): State<Arc<ContentCache>>) -> StatusCode {
    cache.metrics().reset();
    StatusCode::NO_CONTENT
}

async fn inspect(State(cache): State<Arc<ContentCache>>) -> Response {
    Json(cache.inspect().await).into_response()
}

async fn health(State(cache): State<Arc<ContentCache>>) -> Response {
    let health = cache.health();
    let status = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(health)).into_response()
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    pattern: String,
}

#[derive(Debug, Serialize)]
struct InvalidateResponse {
    pattern: String,
    removed: u64,
}

async fn invalidate(
    State(cache): State<Arc<ContentCache>>,
    Json(request): Json<InvalidateRequest>,
) -> Response {
    let removed = cache.invalidate(&request.pattern).await;
    Json(InvalidateResponse {
        pattern: request.pattern,
        removed,
    })
    .into_response()
}

async fn clear(State(cache): State<Arc<ContentCache>>) -> StatusCode {
    cache.clear().await;
    StatusCode::NO_CONTENT
}
