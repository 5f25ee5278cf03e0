use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{AdapterError, TokenUsage, UpstreamRequest};
use crate::service::snapshot::RouteTarget;
use crate::utils::estimate_tokens;
use crate::utils::sse::SseEvent;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The messages API requires max_tokens; applied when the client omits it.
const DEFAULT_MAX_TOKENS: u32 = 1024;

fn new_chat_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn map_stop_reason(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        // end_turn, stop_sequence and anything new read as a normal stop
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

/// OpenAI chat messages → the Anthropic `system` + `messages[]` split.
/// System turns are concatenated into the system string; everything else
/// keeps its role with the content flattened to text.
pub fn build_request(
    payload: &Value,
    target: &RouteTarget,
    stream: bool,
) -> Result<UpstreamRequest, AdapterError> {
    let client_messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::InvalidRequest("'messages' must be an array".to_string()))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in client_messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = message
            .get("content")
            .map(content_to_text)
            .unwrap_or_default();

        match role {
            "system" | "developer" => {
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "assistant" => messages.push(json!({"role": "assistant", "content": text})),
            _ => messages.push(json!({"role": "user", "content": text})),
        }
    }

    if messages.is_empty() {
        return Err(AdapterError::InvalidRequest(
            "at least one non-system message is required".to_string(),
        ));
    }

    let max_tokens = payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_TOKENS as u64);

    let mut body = json!({
        "model": target.model_name,
        "messages": messages,
        "max_tokens": max_tokens,
        "stream": stream,
    });
    let obj = body.as_object_mut().expect("body is an object");

    if !system_parts.is_empty() {
        obj.insert("system".to_string(), json!(system_parts.join("\n\n")));
    }
    if let Some(t) = payload.get("temperature").and_then(Value::as_f64) {
        obj.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = payload.get("top_p").and_then(Value::as_f64) {
        obj.insert("top_p".to_string(), json!(p));
    }
    match payload.get("stop") {
        Some(Value::String(s)) => {
            obj.insert("stop_sequences".to_string(), json!([s]));
        }
        Some(Value::Array(stops)) => {
            obj.insert("stop_sequences".to_string(), json!(stops));
        }
        _ => {}
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "x-api-key",
        HeaderValue::try_from(target.api_key.clone())
            .map_err(|_| AdapterError::Internal("api key is not a valid header value".to_string()))?,
    );
    headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));

    Ok(UpstreamRequest {
        url: format!("{}/v1/messages", target.base_url),
        headers,
        body: body.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

/// Buffered messages-API reply → OpenAI chat completion. Content blocks are
/// recombined into one assistant message.
pub fn translate_response(
    body: Value,
    target: &RouteTarget,
    input_estimate: i32,
) -> (Value, TokenUsage) {
    let text = body.get("content").map(content_to_text).unwrap_or_default();

    let usage = body
        .get("usage")
        .and_then(|u| serde_json::from_value::<AnthropicUsage>(u.clone()).ok())
        .map(|u| TokenUsage {
            input: u.input_tokens as i32,
            output: u.output_tokens as i32,
        })
        .unwrap_or_else(|| TokenUsage {
            input: input_estimate,
            output: estimate_tokens(&text),
        });

    let finish_reason = body
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(map_stop_reason)
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

/// Anthropic's named stream events → OpenAI chunk frames.
///
/// message_start carries the prompt token count, content_block_delta the
/// text, message_delta the output count and stop reason; message_stop and
/// ping have no OpenAI counterpart.
pub struct AnthropicStream {
    public_name: String,
    stream_id: String,
    created: i64,
    usage: TokenUsage,
    saw_usage: bool,
    input_estimate: i32,
    output_chars: usize,
}

impl AnthropicStream {
    pub fn new(target: &RouteTarget, input_estimate: i32) -> Self {
        AnthropicStream {
            public_name: target.public_name.clone(),
            stream_id: new_chat_id(),
            created: Utc::now().timestamp(),
            usage: TokenUsage::default(),
            saw_usage: false,
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
                debug!(error = %e, "dropping unparseable anthropic frame");
                return Vec::new();
            }
        };

        let event_type = event
            .event
            .as_deref()
            .or_else(|| payload.get("type").and_then(Value::as_str))
            .unwrap_or("");

        match event_type {
            "message_start" => {
                if let Some(tokens) = payload
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_i64)
                {
                    self.usage.input = tokens as i32;
                    self.saw_usage = true;
                }
                vec![self.chunk(json!({"role": "assistant", "content": ""}), None)]
            }
            "content_block_delta" => {
                match payload.pointer("/delta/text").and_then(Value::as_str) {
                    Some(text) if !text.is_empty() => {
                        self.output_chars += text.chars().count();
                        vec![self.chunk(json!({"content": text}), None)]
                    }
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                if let Some(tokens) = payload
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_i64)
                {
                    self.usage.output = tokens as i32;
                    self.saw_usage = true;
                }
                let finish = payload
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                    .map(map_stop_reason)
                    .unwrap_or("stop");
                vec![self.chunk(json!({}), Some(finish))]
            }
            // message_stop / ping / content_block_start / content_block_stop
            _ => Vec::new(),
        }
    }

    pub fn usage(&self) -> TokenUsage {
        if self.saw_usage {
            self.usage
        } else {
            TokenUsage {
                input: self.input_estimate,
                output: ((self.output_chars as f64) / 4.0).round() as i32,
            }
        }
    }
}

pub async fn list_models(
    client: &reqwest::Client,
    target: &RouteTarget,
) -> Result<Vec<String>, String> {
    let response = client
        .get(format!("{}/v1/models", target.base_url))
        .header("x-api-key", &target.api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .send()
        .await
        .map_err(|e| e.to_string())?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::target;
    use crate::schema::enum_def::ServiceType;

    fn anthropic_target() -> RouteTarget {
        let mut t = target(ServiceType::Anthropic);
        t.public_name = "claude-public".to_string();
        t.model_name = "claude-3-5-sonnet-latest".to_string();
        t
    }

    #[test]
    fn system_messages_split_out() {
        let payload = json!({
            "model": "claude-public",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "bye"}
            ],
            "temperature": 0.5,
            "stop": "END"
        });
        let req = build_request(&payload, &anthropic_target(), false).unwrap();
        let body: Value = serde_json::from_str(&req.body).unwrap();

        assert_eq!(req.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(body["system"], "Be terse.");
        assert_eq!(body["model"], "claude-3-5-sonnet-latest");
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["stop_sequences"], json!(["END"]));
        assert_eq!(req.headers.get("x-api-key").unwrap(), "sk-upstream-key");
        assert_eq!(req.headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
    }

    #[test]
    fn response_recombined_to_openai_shape() {
        let upstream = json!({
            "id": "msg_123",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-latest",
            "content": [{"type": "text", "text": "Hello "}, {"type": "text", "text": "there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 11, "output_tokens": 7}
        });
        let (body, usage) = translate_response(upstream, &anthropic_target(), 0);

        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "claude-public");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello \nthere");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(usage, TokenUsage { input: 11, output: 7 });
        // The upstream model id must not leak anywhere in the reply.
        assert!(!body.to_string().contains("claude-3-5-sonnet-latest"));
    }

    #[test]
    fn max_tokens_maps_to_length() {
        let upstream = json!({
            "content": [{"type": "text", "text": "cut"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let (body, _) = translate_response(upstream, &anthropic_target(), 0);
        assert_eq!(body["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn stream_event_sequence() {
        let mut stream = AnthropicStream::new(&anthropic_target(), 3);

        let start = stream.translate(SseEvent {
            event: Some("message_start".to_string()),
            data: json!({"type": "message_start", "message": {"usage": {"input_tokens": 12}}}).to_string(),
        });
        assert_eq!(start.len(), 1);
        let first: Value = serde_json::from_str(&start[0].data).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["model"], "claude-public");

        let delta = stream.translate(SseEvent {
            event: Some("content_block_delta".to_string()),
            data: json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}).to_string(),
        });
        let chunk: Value = serde_json::from_str(&delta[0].data).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(chunk["id"], first["id"]);

        let finish = stream.translate(SseEvent {
            event: Some("message_delta".to_string()),
            data: json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 9}}).to_string(),
        });
        let last: Value = serde_json::from_str(&finish[0].data).unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");

        // message_stop produces nothing; the runtime owns [DONE]
        let stop = stream.translate(SseEvent {
            event: Some("message_stop".to_string()),
            data: json!({"type": "message_stop"}).to_string(),
        });
        assert!(stop.is_empty());

        assert_eq!(stream.usage(), TokenUsage { input: 12, output: 9 });
    }

    #[test]
    fn ping_and_garbage_are_dropped() {
        let mut stream = AnthropicStream::new(&anthropic_target(), 0);
        assert!(stream
            .translate(SseEvent {
                event: Some("ping".to_string()),
                data: json!({"type": "ping"}).to_string(),
            })
            .is_empty());
        assert!(stream.translate(SseEvent::data("{broken")).is_empty());
    }
}
