use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::controller::BaseError;
use crate::database::stat::{self, BucketSize};
use crate::database::{now_millis, Db};
use crate::service::AppState;
use crate::utils::HttpResult;

const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
struct WindowQuery {
    start: Option<i64>,
    end: Option<i64>,
    limit: Option<usize>,
    bucket: Option<BucketSize>,
}

impl WindowQuery {
    /// Missing bounds read as "everything up to now".
    fn range(&self) -> Result<(i64, i64), BaseError> {
        let start = self.start.unwrap_or(0);
        let end = self.end.unwrap_or_else(now_millis);
        if start > end {
            return Err(BaseError::ParamInvalid(Some(
                "'start' must not be after 'end'".to_string(),
            )));
        }
        Ok((start, end))
    }
}

async fn clients(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Response, BaseError> {
    let (start, end) = query.range()?;
    let db: Db = state.db.clone();
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let board = tokio::task::spawn_blocking(move || stat::client_leaderboard(&db, start, end, limit))
        .await
        .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))??;
    Ok(HttpResult::new(board).into_response())
}

async fn models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Response, BaseError> {
    let (start, end) = query.range()?;
    let db = state.db.clone();
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let board = tokio::task::spawn_blocking(move || stat::model_leaderboard(&db, start, end, limit))
        .await
        .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))??;
    Ok(HttpResult::new(board).into_response())
}

async fn timeseries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Response, BaseError> {
    let (start, end) = query.range()?;
    let bucket = query.bucket.unwrap_or_default();

    // An unbounded window would enumerate buckets back to the epoch.
    if query.start.is_none() {
        return Err(BaseError::ParamInvalid(Some(
            "'start' is required for time buckets".to_string(),
        )));
    }

    let db = state.db.clone();
    let series = tokio::task::spawn_blocking(move || stat::time_buckets(&db, start, end, bucket))
        .await
        .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))??;
    Ok(HttpResult::new(series).into_response())
}

async fn overview(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Response, BaseError> {
    let (start, end) = query.range()?;
    let db = state.db.clone();
    let stats = tokio::task::spawn_blocking(move || stat::overview(&db, start, end))
        .await
        .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))??;
    Ok(HttpResult::new(stats).into_response())
}

async fn recent_usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Response, BaseError> {
    let limit = query.limit.unwrap_or(50).min(500) as i64;
    let db = state.db.clone();
    let (total, list) = tokio::task::spawn_blocking(move || {
        let total = crate::database::usage_record::UsageRecord::count(&db)?;
        let list = crate::database::usage_record::UsageRecord::list_recent(&db, limit)?;
        Ok::<_, BaseError>((total, list))
    })
    .await
    .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))??;
    Ok(HttpResult::new(serde_json::json!({"total": total, "list": list})).into_response())
}

pub fn create_stat_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats/clients", get(clients))
        .route("/stats/models", get(models))
        .route("/stats/timeseries", get(timeseries))
        .route("/stats/overview", get(overview))
        .route("/usage/recent", get(recent_usage))
}
