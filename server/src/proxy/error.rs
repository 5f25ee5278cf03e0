use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::schema::enum_def::UsageStatus;

/// Everything the proxy surface can hand back to a client, mapped onto the
/// OpenAI error body shape. The upstream's own error body is never forwarded
/// verbatim; only its message text may be carried in `message`.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Model '{0}' not found")]
    ModelNotFound(String),
    #[error("Model '{0}' is not available on this endpoint")]
    NotAvailableOnEndpoint(String),
    #[error("upstream authentication failed: {0}")]
    UpstreamAuth(String),
    #[error("upstream rate limited: {0}")]
    RateLimited(String),
    #[error("upstream request timed out after {0} ms")]
    Timeout(u128),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::NotAvailableOnEndpoint(_) => StatusCode::FORBIDDEN,
            ProxyError::UpstreamAuth(_) => StatusCode::UNAUTHORIZED,
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::ModelNotFound(_) => "invalid_request_error",
            ProxyError::NotAvailableOnEndpoint(_) => "permission_denied",
            ProxyError::UpstreamAuth(_) => "authentication_error",
            ProxyError::RateLimited(_) => "rate_limit_error",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::Upstream(_) => "upstream_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    fn param(&self) -> Option<&'static str> {
        match self {
            ProxyError::ModelNotFound(_) | ProxyError::NotAvailableOnEndpoint(_) => Some("model"),
            _ => None,
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ProxyError::ModelNotFound(_) => Some("model_not_found"),
            ProxyError::NotAvailableOnEndpoint(_) => Some("model_not_available_on_endpoint"),
            _ => None,
        }
    }

    /// How this outcome is recorded in the usage ledger.
    pub fn usage_status(&self) -> UsageStatus {
        match self {
            ProxyError::InvalidRequest(_)
            | ProxyError::ModelNotFound(_)
            | ProxyError::NotAvailableOnEndpoint(_) => UsageStatus::ClientError,
            ProxyError::Timeout(_) => UsageStatus::Timeout,
            _ => UsageStatus::UpstreamError,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.error_type(),
        });
        if let Some(param) = self.param() {
            error["param"] = json!(param);
        }
        if let Some(code) = self.code() {
            error["code"] = json!(code);
        }
        (self.status(), Json(json!({ "error": error }))).into_response()
    }
}
