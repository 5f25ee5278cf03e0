use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Admin-API error envelope: `{code, msg}` with a stable numeric code per
/// category.
#[derive(Debug)]
pub enum BaseError {
    ParamInvalid(Option<String>),
    DatabaseFatal(Option<String>),
    DatabaseDup(Option<String>),
    NotFound(Option<String>),
    InternalServerError(Option<String>),
}

impl std::fmt::Display for BaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            BaseError::ParamInvalid(m)
            | BaseError::DatabaseFatal(m)
            | BaseError::DatabaseDup(m)
            | BaseError::NotFound(m)
            | BaseError::InternalServerError(m) => m.as_deref().unwrap_or("unknown error"),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for BaseError {}

impl From<diesel::result::Error> for BaseError {
    fn from(err: diesel::result::Error) -> Self {
        BaseError::DatabaseFatal(Some(err.to_string()))
    }
}

impl IntoResponse for BaseError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            BaseError::ParamInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                1001,
                msg.unwrap_or_else(|| "request params invalid".to_string()),
            ),
            BaseError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                1002,
                msg.unwrap_or_else(|| "data not found".to_string()),
            ),
            BaseError::DatabaseFatal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                1100,
                msg.unwrap_or_else(|| "database error".to_string()),
            ),
            BaseError::DatabaseDup(msg) => (
                StatusCode::BAD_REQUEST,
                1101,
                msg.unwrap_or_else(|| "a unique key conflicted".to_string()),
            ),
            BaseError::InternalServerError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                0,
                msg.unwrap_or_else(|| "internal server error".to_string()),
            ),
        };
        let body = Json(json!({
            "code": code,
            "msg": message,
        }));
        (status, body).into_response()
    }
}
