use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};

use crate::adapters;
use crate::controller::BaseError;
use crate::database::health_status::HealthStatus;
use crate::database::llm_config::LlmConfig;
use crate::service::config_service::{CreateConfigRequest, UpdateConfigRequest};
use crate::service::AppState;
use crate::utils::HttpResult;

async fn list_configs(State(state): State<Arc<AppState>>) -> Result<Response, BaseError> {
    let configs = state.configs.list()?;
    Ok(HttpResult::new(configs).into_response())
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, BaseError> {
    let reveal = params.get("reveal").map(|v| v == "true").unwrap_or(false);
    let config = state
        .configs
        .get(id, reveal)?
        .ok_or_else(|| BaseError::NotFound(Some(format!("config {id} not found"))))?;
    Ok(HttpResult::new(config).into_response())
}

async fn create_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateConfigRequest>,
) -> Result<Response, BaseError> {
    let created = state.configs.create(body)?;
    Ok(HttpResult::new(created).into_response())
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateConfigRequest>,
) -> Result<Response, BaseError> {
    let updated = state.configs.update(id, body)?;
    Ok(HttpResult::new(updated).into_response())
}

async fn delete_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, BaseError> {
    state.configs.delete(id)?;
    Ok(HttpResult::new(serde_json::json!({"deleted": id})).into_response())
}

fn resolve_target(
    state: &Arc<AppState>,
    id: i64,
) -> Result<crate::service::snapshot::RouteTarget, BaseError> {
    // Probes work against the stored row (not the snapshot) so disabled
    // configs can be checked before being enabled.
    let row = LlmConfig::get(&state.db, id)?
        .ok_or_else(|| BaseError::NotFound(Some(format!("config {id} not found"))))?;
    state
        .configs
        .build_probe_target(&row)
        .map_err(|reason| BaseError::ParamInvalid(Some(reason)))
}

/// Runs the adapter health probe now, stores the result, returns it.
async fn check_health(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, BaseError> {
    let target = resolve_target(&state, id)?;
    let probe = adapters::probe_health(&state.http, &target).await;
    HealthStatus::upsert(&state.db, &probe)?;
    Ok(HttpResult::new(probe).into_response())
}

/// Best-effort listing of the upstream's advertised models.
async fn discover_models(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, BaseError> {
    let target = resolve_target(&state, id)?;
    let models = adapters::list_models(&state.http, &target)
        .await
        .map_err(|reason| BaseError::InternalServerError(Some(reason)))?;
    Ok(HttpResult::new(models).into_response())
}

async fn list_health(State(state): State<Arc<AppState>>) -> Result<Response, BaseError> {
    let rows = HealthStatus::list_all(&state.db)?;
    Ok(HttpResult::new(rows).into_response())
}

pub fn create_config_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/configs", get(list_configs).post(create_config))
        .route(
            "/configs/{id}",
            put(update_config).get(get_config).delete(delete_config),
        )
        .route("/configs/{id}/health", post(check_health))
        .route("/configs/{id}/models", get(discover_models))
        .route("/health-status", get(list_health))
}
