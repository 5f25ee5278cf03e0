use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::proxy::core::relay_chat;
use crate::proxy::error::ProxyError;
use crate::service::snapshot::EndpointKind;
use crate::service::AppState;
use crate::utils::client_ip;

/// `GET /v1/models` — the union of enabled configs visible on this
/// endpoint, in the OpenAI list shape.
pub async fn list_models(state: Arc<AppState>, kind: EndpointKind) -> Response {
    let snapshot = state.snapshot.load();
    let data: Vec<Value> = snapshot
        .visible(kind)
        .iter()
        .map(|target| {
            json!({
                "id": target.public_name,
                "object": "model",
                "created": target.created_at / 1000,
                "owned_by": target.service_type.to_string(),
                "permission": [],
                "root": target.public_name,
                "parent": null,
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data})).into_response()
}

/// `POST /v1/chat/completions` — the primary path.
pub async fn chat_completions(
    state: Arc<AppState>,
    kind: EndpointKind,
    addr: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client_ip(&headers, addr);
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("request body is not valid JSON: {e}"))
                .into_response()
        }
    };
    relay_chat(state, kind, "/v1/chat/completions", ip, payload).await
}

/// `POST /v1/completions` — legacy surface, synthesised as a single
/// user-message chat request. Applies to every provider, Anthropic
/// included.
pub async fn completions(
    state: Arc<AppState>,
    kind: EndpointKind,
    addr: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client_ip(&headers, addr);
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("request body is not valid JSON: {e}"))
                .into_response()
        }
    };

    let chat_payload = match completions_to_chat(&payload) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    relay_chat(state, kind, "/v1/completions", ip, chat_payload).await
}

fn completions_to_chat(payload: &Value) -> Result<Value, ProxyError> {
    let prompt = match payload.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => {
            return Err(ProxyError::InvalidRequest(
                "'prompt' is required and must be a string or array of strings".to_string(),
            ))
        }
    };

    let mut chat = json!({
        "messages": [{"role": "user", "content": prompt}],
    });
    let obj = chat.as_object_mut().expect("chat is an object");
    for key in ["model", "max_tokens", "temperature", "top_p", "stop", "stream"] {
        if let Some(v) = payload.get(key) {
            obj.insert(key.to_string(), v.clone());
        }
    }
    Ok(chat)
}

/// Shallow liveness for each proxy port, with the recorder counters the
/// operator actually looks at first.
pub async fn health(state: Arc<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "checks": {
            "db": state.db.ping(),
            "queue_depth": state.recorder.queue_depth(),
            "dropped_usage_records": state.recorder.dropped(),
            "in_flight": state.in_flight.load(Ordering::Relaxed),
        }
    }))
    .into_response()
}
