use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{AdapterError, TokenUsage, UpstreamRequest, VSCODE_PROXY_MODEL};
use crate::service::snapshot::RouteTarget;
use crate::utils::estimate_tokens;
use crate::utils::sse::SseEvent;

/// Parameters the OpenAI-compatible surface accepts; anything else the
/// client sent is dropped rather than forwarded blind.
const ALLOWED_PARAMS: &[&str] = &[
    "messages",
    "temperature",
    "top_p",
    "max_tokens",
    "max_completion_tokens",
    "stop",
    "n",
    "presence_penalty",
    "frequency_penalty",
    "seed",
    "user",
    "tools",
    "tool_choice",
    "response_format",
    "logprobs",
    "top_logprobs",
    "stream_options",
];

fn filtered_payload(payload: &Value, model: &str, stream: bool) -> Map<String, Value> {
    let mut body = Map::new();
    if let Some(obj) = payload.as_object() {
        for (key, value) in obj {
            if ALLOWED_PARAMS.contains(&key.as_str()) {
                body.insert(key.clone(), value.clone());
            }
        }
    }
    body.insert("model".to_string(), json!(model));
    body.insert("stream".to_string(), json!(stream));
    body
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

pub fn build_request(
    payload: &Value,
    target: &RouteTarget,
    stream: bool,
) -> Result<UpstreamRequest, AdapterError> {
    let mut body = filtered_payload(payload, &target.model_name, stream);
    if stream {
        // Ask for the usage frame so streamed requests can be metered.
        body.insert("stream_options".to_string(), json!({"include_usage": true}));
    }

    let mut headers = json_headers();
    if !target.api_key.is_empty() {
        let bearer = format!("Bearer {}", target.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::try_from(bearer)
                .map_err(|_| AdapterError::Internal("api key is not a valid header value".to_string()))?,
        );
    }

    Ok(UpstreamRequest {
        url: format!("{}/chat/completions", target.base_url),
        headers,
        body: serde_json::to_string(&body)
            .map_err(|e| AdapterError::Internal(format!("failed to serialize upstream body: {e}")))?,
    })
}

/// The VS Code proxy is trusted and local: no credential is attached and the
/// model id is pinned to the token the upstream recognises.
pub fn build_vscode_request(
    payload: &Value,
    target: &RouteTarget,
    stream: bool,
) -> Result<UpstreamRequest, AdapterError> {
    let mut body = filtered_payload(payload, VSCODE_PROXY_MODEL, stream);
    body.remove("stream_options");

    Ok(UpstreamRequest {
        url: format!("{}/v1/chat/completions", target.base_url),
        headers: json_headers(),
        body: serde_json::to_string(&body)
            .map_err(|e| AdapterError::Internal(format!("failed to serialize upstream body: {e}")))?,
    })
}

fn usage_from_value(v: &Value) -> Option<TokenUsage> {
    let usage = v.get("usage")?;
    let input = usage.get("prompt_tokens").and_then(Value::as_i64);
    let output = usage.get("completion_tokens").and_then(Value::as_i64);
    match (input, output) {
        (None, None) => None,
        (i, o) => Some(TokenUsage {
            input: i.unwrap_or(0) as i32,
            output: o.unwrap_or(0) as i32,
        }),
    }
}

fn completion_text(v: &Value) -> String {
    let mut out = String::new();
    if let Some(choices) = v.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(text) = choice
                .pointer("/message/content")
                .and_then(Value::as_str)
            {
                out.push_str(text);
            }
        }
    }
    out
}

/// Same wire shape in and out: rewrite `model`, guarantee `usage`.
/// Minimal upstreams (lmstudio, odd openai_compatible servers) frequently
/// omit usage, hence the estimate.
pub fn translate_response(
    mut body: Value,
    target: &RouteTarget,
    input_estimate: i32,
) -> (Value, TokenUsage) {
    let usage = usage_from_value(&body).unwrap_or_else(|| TokenUsage {
        input: input_estimate,
        output: estimate_tokens(&completion_text(&body)),
    });

    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), json!(target.public_name));
        obj.insert(
            "usage".to_string(),
            json!({
                "prompt_tokens": usage.input,
                "completion_tokens": usage.output,
                "total_tokens": usage.total(),
            }),
        );
    }
    (body, usage)
}

/// Streaming passthrough with the model rewritten on every chunk. Keeps a
/// running output estimate in case the upstream never sends the usage frame.
pub struct OpenaiStream {
    public_name: String,
    reported: Option<TokenUsage>,
    input_estimate: i32,
    output_chars: usize,
}

impl OpenaiStream {
    pub fn new(target: &RouteTarget, input_estimate: i32) -> Self {
        OpenaiStream {
            public_name: target.public_name.clone(),
            reported: None,
            input_estimate,
            output_chars: 0,
        }
    }

    pub fn translate(&mut self, event: SseEvent) -> Vec<SseEvent> {
        if event.data.trim() == "[DONE]" {
            return Vec::new();
        }

        let mut chunk: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "dropping unparseable upstream chunk");
                return Vec::new();
            }
        };

        if let Some(usage) = usage_from_value(&chunk) {
            self.reported = Some(usage);
        }
        if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
                    self.output_chars += text.chars().count();
                }
            }
        }

        if let Some(obj) = chunk.as_object_mut() {
            obj.insert("model".to_string(), json!(self.public_name));
        }
        vec![SseEvent::data(chunk.to_string())]
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
    let url = if target.service_type == crate::schema::enum_def::ServiceType::VscodeProxy {
        format!("{}/v1/models", target.base_url)
    } else {
        format!("{}/models", target.base_url)
    };

    let mut request = client.get(&url);
    if !target.api_key.is_empty() {
        request = request.bearer_auth(&target.api_key);
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("upstream returned {}", response.status()));
    }
    let body: Value = response.json().await.map_err(|e| e.to_string())?;
    Ok(body
        .get("data")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default())
}
