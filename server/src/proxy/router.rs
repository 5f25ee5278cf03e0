use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;

use super::handlers::{chat_completions, completions, health, list_models};
use crate::service::snapshot::EndpointKind;
use crate::service::AppState;

/// One OpenAI-compatible listener. The two proxy ports run the same router
/// parameterised by `kind`; only model visibility differs.
pub fn create_proxy_router(kind: EndpointKind) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/v1/models",
            get(move |State(state): State<Arc<AppState>>| async move {
                list_models(state, kind).await
            }),
        )
        .route(
            "/v1/chat/completions",
            post(
                move |State(state): State<Arc<AppState>>,
                      ConnectInfo(addr): ConnectInfo<SocketAddr>,
                      headers: HeaderMap,
                      body: Bytes| async move {
                    chat_completions(state, kind, addr, headers, body).await
                },
            ),
        )
        .route(
            "/v1/completions",
            post(
                move |State(state): State<Arc<AppState>>,
                      ConnectInfo(addr): ConnectInfo<SocketAddr>,
                      headers: HeaderMap,
                      body: Bytes| async move {
                    completions(state, kind, addr, headers, body).await
                },
            ),
        )
        .route(
            "/health",
            get(|State(state): State<Arc<AppState>>| async move { health(state).await }),
        )
}
