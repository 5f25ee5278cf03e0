use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::service::AppState;

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let db_ok = state.db.ping();
    let body = json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "checks": {
            "db": db_ok,
            "queue_depth": state.recorder.queue_depth(),
            "dropped_usage_records": state.recorder.dropped(),
            "in_flight": state.in_flight.load(Ordering::Relaxed),
        }
    });
    if db_ok {
        Json(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

/// Ready means: database reachable and at least one config serving traffic.
async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let db_ok = state.db.ping();
    let snapshot = state.snapshot.load();
    let ready = db_ok && !snapshot.is_empty();
    let body = json!({
        "ready": ready,
        "db": db_ok,
        "loaded_configs": snapshot.len(),
        "snapshot_built_at": snapshot.built_at(),
    });
    if ready {
        Json(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

async fn live() -> Response {
    Json(json!({"live": true})).into_response()
}

pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
}
