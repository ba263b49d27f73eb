// Router assembly: health is open; everything else runs behind the
// auth -> rate-limit -> validation pipeline.

use axum::{middleware, routing::get, Json, Router};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::queue::JobQueue;
use crate::storage::database::health_check;

use super::auth::auth_middleware;
use super::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let authed = Router::new()
        .merge(crate::ingest::api::routes())
        .merge(super::query::routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.config.server.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    let config_ok = health_check(state.config_store.pool()).await.is_ok();
    let telemetry_ok = health_check(state.telemetry.pool()).await.is_ok();
    let queue_ok = state.queue.pending_count().await.is_ok();

    let healthy = config_ok && telemetry_ok && queue_ok;
    let status = if healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "checks": {
                "config_store": config_ok,
                "telemetry_store": telemetry_ok,
                "job_queue": queue_ok,
            },
            "buffered_rows": state.batcher.buffered_rows(),
        })),
    )
}
