use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use crate::service::AppState;

mod error;
mod health;
mod llm_config;
mod stat;

pub use error::BaseError;

/// `POST /admin/reload` — re-validates every enabled config and publishes a
/// fresh snapshot. Callable by the UI and by an operator with curl.
async fn reload(State(state): State<Arc<AppState>>) -> Result<Response, BaseError> {
    let report = state.configs.reload()?;
    Ok(Json(report).into_response())
}

/// The admin/UI listener: reload, health probes, config CRUD and the
/// dashboard aggregations. The HTML UI in front of this is a separate
/// deliverable; everything here is JSON.
pub fn create_admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/reload", post(reload))
        .merge(health::create_health_router())
        .nest(
            "/api",
            Router::new()
                .merge(llm_config::create_config_router())
                .merge(stat::create_stat_router()),
        )
}
