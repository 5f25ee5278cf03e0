use std::time::Instant;

use reqwest::header::HeaderMap;
use serde_json::Value;
use thiserror::Error;

use crate::database::health_status::HealthStatus;
use crate::database::now_millis;
use crate::schema::enum_def::{HealthState, ServiceType};
use crate::service::snapshot::RouteTarget;
use crate::utils::sse::SseEvent;

pub mod anthropic;
pub mod gemini;
pub mod openai;

/// The fixed model token the VS Code language-model proxy expects; the
/// upstream substitutes whatever model is selected in the editor.
pub const VSCODE_PROXY_MODEL: &str = "vscode-lm-proxy";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Internal(String),
}

/// Ready-to-send upstream call.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: i32,
    pub output: i32,
}

impl TokenUsage {
    pub fn total(&self) -> i32 {
        self.input.saturating_add(self.output)
    }
}

/// Builds the authenticated upstream request for `target`, rewriting the
/// public model id to the upstream one and dropping parameters the provider
/// rejects. `payload` is the validated OpenAI-shaped client body.
pub fn translate_request(
    payload: &Value,
    target: &RouteTarget,
    stream: bool,
) -> Result<UpstreamRequest, AdapterError> {
    match target.service_type {
        ServiceType::Openai
        | ServiceType::Openrouter
        | ServiceType::Lmstudio
        | ServiceType::OpenaiCompatible => openai::build_request(payload, target, stream),
        ServiceType::VscodeProxy => openai::build_vscode_request(payload, target, stream),
        ServiceType::Anthropic => anthropic::build_request(payload, target, stream),
        ServiceType::Gemini => gemini::build_request(payload, target, stream),
        ServiceType::None => Err(AdapterError::InvalidRequest(
            "service_type 'none' is not routable".to_string(),
        )),
    }
}

/// Rewrites a buffered upstream success body into the OpenAI response shape
/// with `model` set to the public name and a usage object always present.
/// `input_estimate` backs the fallback when the upstream reports nothing.
pub fn translate_response(
    body: Value,
    target: &RouteTarget,
    input_estimate: i32,
) -> (Value, TokenUsage) {
    match target.service_type {
        ServiceType::Anthropic => anthropic::translate_response(body, target, input_estimate),
        ServiceType::Gemini => gemini::translate_response(body, target, input_estimate),
        _ => openai::translate_response(body, target, input_estimate),
    }
}

/// Stateful streaming translator: upstream SSE frames in, OpenAI chunk
/// frames out. The upstream's own terminator is swallowed; the proxy
/// runtime appends the single `data: [DONE]` itself.
pub enum ChunkTranslator {
    Openai(openai::OpenaiStream),
    Anthropic(anthropic::AnthropicStream),
    Gemini(gemini::GeminiStream),
}

impl ChunkTranslator {
    pub fn new(target: &RouteTarget, input_estimate: i32) -> Self {
        match target.service_type {
            ServiceType::Anthropic => {
                ChunkTranslator::Anthropic(anthropic::AnthropicStream::new(target, input_estimate))
            }
            ServiceType::Gemini => {
                ChunkTranslator::Gemini(gemini::GeminiStream::new(target, input_estimate))
            }
            _ => ChunkTranslator::Openai(openai::OpenaiStream::new(target, input_estimate)),
        }
    }

    /// A frame that fails to parse is dropped (empty vec); the stream goes
    /// on. Ordering of emitted frames follows the upstream exactly.
    pub fn translate(&mut self, event: SseEvent) -> Vec<SseEvent> {
        match self {
            ChunkTranslator::Openai(s) => s.translate(event),
            ChunkTranslator::Anthropic(s) => s.translate(event),
            ChunkTranslator::Gemini(s) => s.translate(event),
        }
    }

    /// Best-known accounting once the stream ends: upstream-reported when
    /// available, otherwise the running estimate.
    pub fn usage(&self) -> TokenUsage {
        match self {
            ChunkTranslator::Openai(s) => s.usage(),
            ChunkTranslator::Anthropic(s) => s.usage(),
            ChunkTranslator::Gemini(s) => s.usage(),
        }
    }
}

/// Best-effort probe of the upstream's advertised model ids.
pub async fn list_models(
    client: &reqwest::Client,
    target: &RouteTarget,
) -> Result<Vec<String>, String> {
    match target.service_type {
        ServiceType::Anthropic => anthropic::list_models(client, target).await,
        ServiceType::Gemini => gemini::list_models(client, target).await,
        ServiceType::None => Err("service_type 'none' has no upstream".to_string()),
        _ => openai::list_models(client, target).await,
    }
}

/// Cheap reachability probe (a models listing) producing the row the
/// dashboard consumes.
pub async fn probe_health(client: &reqwest::Client, target: &RouteTarget) -> HealthStatus {
    let started = Instant::now();
    let outcome = list_models(client, target).await;
    let rtt = started.elapsed().as_millis() as i64;

    match outcome {
        Ok(models) => HealthStatus {
            config_id: target.config_id,
            status: HealthState::Ok,
            checked_at: now_millis(),
            response_time_ms: Some(rtt),
            model_count: Some(models.len() as i32),
            error_message: None,
        },
        Err(reason) => HealthStatus {
            config_id: target.config_id,
            status: HealthState::Ng,
            checked_at: now_millis(),
            response_time_ms: Some(rtt),
            model_count: None,
            error_message: Some(reason),
        },
    }
}

/// Rough prompt-side token estimate from the client messages, used whenever
/// an upstream reports no usage.
pub fn estimate_input_tokens(payload: &Value) -> i32 {
    let mut chars = 0usize;
    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for message in messages {
            match message.get("content") {
                Some(Value::String(s)) => chars += s.chars().count(),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if let Some(s) = part.get("text").and_then(Value::as_str) {
                            chars += s.chars().count();
                        }
                    }
                }
                _ => {}
            }
        }
    }
    ((chars as f64) / 4.0).round() as i32
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_estimate_counts_text_parts() {
        let payload = json!({
            "model": "gpt-4",
            "messages": [
                {"role": "user", "content": "12345678"},
                {"role": "user", "content": [{"type": "text", "text": "1234"}]},
            ]
        });
        assert_eq!(estimate_input_tokens(&payload), 3);
    }

    #[test]
    fn none_service_is_not_routable() {
        let target = test_support::target(ServiceType::None);
        let err = translate_request(&json!({"model": "x", "messages": []}), &target, false);
        assert!(err.is_err());
    }
}
