use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::debug;

use super::{AdapterError, TokenUsage, UpstreamRequest};
use crate::service::snapshot::RouteTarget;
use crate::utils::estimate_tokens;
use crate::utils::sse::SseEvent;

fn new_chat_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// OpenAI chat → Google AI Studio `generateContent`. System turns become the
/// `system_instruction`, assistant turns the `model` role, and the sampling
/// knobs move into `generationConfig`.
pub fn build_request(
    payload: &Value,
    target: &RouteTarget,
    stream: bool,
) -> Result<UpstreamRequest, AdapterError> {
    let client_messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::InvalidRequest("'messages' must be an array".to_string()))?;

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in client_messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = message
            .get("content")
            .map(content_to_text)
            .unwrap_or_default();
        if text.is_empty() {
            continue;
        }

        match role {
            "system" | "developer" => system_parts.push(json!({"text": text})),
            "assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }

    if contents.is_empty() {
        return Err(AdapterError::InvalidRequest(
            "at least one non-system message is required".to_string(),
        ));
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(t) = payload.get("temperature").and_then(Value::as_f64) {
        generation_config.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = payload.get("top_p").and_then(Value::as_f64) {
        generation_config.insert("topP".to_string(), json!(p));
    }
    if let Some(m) = payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
        .and_then(Value::as_u64)
    {
        generation_config.insert("maxOutputTokens".to_string(), json!(m));
    }
    match payload.get("stop") {
        Some(Value::String(s)) => {
            generation_config.insert("stopSequences".to_string(), json!([s]));
        }
        Some(Value::Array(stops)) => {
            generation_config.insert("stopSequences".to_string(), json!(stops));
        }
        _ => {}
    }

    let mut body = json!({"contents": contents});
    let obj = body.as_object_mut().expect("body is an object");
    if !system_parts.is_empty() {
        obj.insert(
            "system_instruction".to_string(),
            json!({"parts": system_parts}),
        );
    }
    if !generation_config.is_empty() {
        obj.insert("generationConfig".to_string(), Value::Object(generation_config));
    }

    let action = if stream {
        "streamGenerateContent?alt=sse"
    } else {
        "generateContent"
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "x-goog-api-key",
        HeaderValue::try_from(target.api_key.clone())
            .map_err(|_| AdapterError::Internal("api key is not a valid header value".to_string()))?,
    );

    Ok(UpstreamRequest {
        url: format!("{}/models/{}:{}", target.base_url, target.model_name, action),
        headers,
        body: body.to_string(),
    })
}

fn usage_from_metadata(body: &Value) -> Option<TokenUsage> {
    let metadata = body.get("usageMetadata")?;
    Some(TokenUsage {
        input: metadata
            .get("promptTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32,
        output: metadata
            .get("candidatesTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32,
    })
}

fn candidate_text(body: &Value) -> String {
    body.pointer("/candidates/0/content/parts")
        .map(|parts| content_to_text(&json!(parts)))
        .unwrap_or_default()
}

pub fn translate_response(
    body: Value,
    target: &RouteTarget,
    input_estimate: i32,
) -> (Value, TokenUsage) {
    let text = candidate_text(&body);
    let usage = usage_from_metadata(&body).unwrap_or_else(|| TokenUsage {
        input: input_estimate,
        output: estimate_tokens(&text),
    });
    let finish_reason = body
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
        .map(map_finish_reason)
        .unwrap_or("stop");

    let translated = json!({
        "id": new_chat_id(),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": target.public_name,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": usage.input,
            "completion_tokens": usage.output,
            "total_tokens": usage.total(),
        }
    });
    (translated, usage)
}

/// `streamGenerateContent?alt=sse` frames → OpenAI chunks. Each frame is a
/// partial GenerateContentResponse; usage arrives on the tail frames.
pub struct GeminiStream {
    public_name: String,
    stream_id: String,
    created: i64,
    first_chunk: bool,
    reported: Option<TokenUsage>,
    input_estimate: i32,
    output_chars: usize,
}

impl GeminiStream {
    pub fn new(target: &RouteTarget, input_estimate: i32) -> Self {
        GeminiStream {
            public_name: target.public_name.clone(),
            stream_id: new_chat_id(),
            created: Utc::now().timestamp(),
            first_chunk: true,
            reported: None,
            input_estimate,
            output_chars: 0,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> SseEvent {
        SseEvent::data(
            json!({
                "id": self.stream_id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.public_name,
                "choices": [{
                    "index": 0,
                    "delta": delta,
                    "finish_reason": finish_reason,
                }]
            })
            .to_string(),
        )
    }

    pub fn translate(&mut self, event: SseEvent) -> Vec<SseEvent> {
        let payload: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "dropping unparseable gemini frame");
                return Vec::new();
            }
        };

        if let Some(usage) = usage_from_metadata(&payload) {
            self.reported = Some(usage);
        }

        let text = candidate_text(&payload);
        let finish = payload
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .map(map_finish_reason);

        let mut out = Vec::new();
        if !text.is_empty() {
            self.output_chars += text.chars().count();
            let delta = if self.first_chunk {
                json!({"role": "assistant", "content": text})
            } else {
                json!({"content": text})
            };
            self.first_chunk = false;
            out.push(self.chunk(delta, None));
        }
        if let Some(reason) = finish {
            out.push(self.chunk(json!({}), Some(reason)));
        }
        out
    }

    pub fn usage(&self) -> TokenUsage {
        self.reported.unwrap_or(TokenUsage {
            input: self.input_estimate,
            output: ((self.output_chars as f64) / 4.0).round() as i32,
        })
    }
}

pub async fn list_models(
    client: &reqwest::Client,
    target: &RouteTarget,
) -> Result<Vec<String>, String> {
    let response = client
        .get(format!("{}/models", target.base_url))
        .header("x-goog-api-key", &target.api_key)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("upstream returned {}", response.status()));
    }
    let body: Value = response.json().await.map_err(|e| e.to_string())?;
    Ok(body
        .get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(Value::as_str))
                .map(|name| name.strip_prefix("models/").unwrap_or(name).to_string())
                .collect()
        })
        .unwrap_or_default())
}
