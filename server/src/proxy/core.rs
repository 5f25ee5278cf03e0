use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::adapters::{self, ChunkTranslator, TokenUsage};
use crate::database::now_millis;
use crate::database::usage_record::NewUsageRecord;
use crate::proxy::error::ProxyError;
use crate::schema::enum_def::UsageStatus;
use crate::service::snapshot::{EndpointKind, RouteTarget};
use crate::service::usage::UsageRecorder;
use crate::service::AppState;
use crate::utils::sse::{SseEvent, SseParser};

/// Per-request accounting. Exactly one record leaves through one of the
/// `finish_*` paths (or the stream guard when the client walks away).
pub struct RequestMeter {
    recorder: UsageRecorder,
    started: Instant,
    route: &'static str,
    client_ip: String,
    public_name: String,
    config_id: Option<i64>,
}

impl RequestMeter {
    pub fn new(
        recorder: UsageRecorder,
        route: &'static str,
        client_ip: String,
        public_name: String,
    ) -> Self {
        RequestMeter {
            recorder,
            started: Instant::now(),
            route,
            client_ip,
            public_name,
            config_id: None,
        }
    }

    pub fn set_target(&mut self, target: &RouteTarget) {
        self.config_id = Some(target.config_id);
    }

    pub fn set_public_name(&mut self, name: &str) {
        self.public_name = name.to_string();
    }

    pub fn finish_success(self, usage: TokenUsage) {
        self.write(UsageStatus::Success, None, usage);
    }

    pub fn finish_error(self, status: UsageStatus, message: &str, usage: TokenUsage) {
        self.write(status, Some(message.to_string()), usage);
    }

    fn write(self, status: UsageStatus, error_message: Option<String>, usage: TokenUsage) {
        let response_time_ms = self.started.elapsed().as_millis() as i64;
        info!(
            method = "POST",
            path = self.route,
            public_name = %self.public_name,
            client_ip = %self.client_ip,
            status = %status,
            response_time_ms,
            input_tokens = usage.input,
            output_tokens = usage.output,
            "request completed"
        );
        self.recorder.record(NewUsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now_millis(),
            client_ip: self.client_ip,
            public_name: self.public_name,
            config_id: self.config_id,
            input_tokens: usage.input.max(0),
            output_tokens: usage.output.max(0),
            total_tokens: usage.total().max(0),
            response_time_ms,
            status,
            error_message,
        });
    }
}

/// Keeps the meter alive inside a streaming body. If the client drops the
/// connection the generator is dropped mid-flight and this writes a
/// client_error row with whatever was counted up to that point.
struct StreamGuard {
    meter: Option<RequestMeter>,
    usage: TokenUsage,
}

impl StreamGuard {
    fn finish_success(&mut self, usage: TokenUsage) {
        if let Some(meter) = self.meter.take() {
            self.usage = usage;
            meter.finish_success(usage);
        }
    }

    fn finish_error(&mut self, status: UsageStatus, message: &str, usage: TokenUsage) {
        if let Some(meter) = self.meter.take() {
            self.usage = usage;
            meter.finish_error(status, message, usage);
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(meter) = self.meter.take() {
            warn!(public_name = %meter.public_name, "client closed connection mid-stream");
            meter.finish_error(UsageStatus::ClientError, "client closed connection", self.usage);
        }
    }
}

struct InFlight {
    state: Arc<AppState>,
}

impl InFlight {
    fn new(state: Arc<AppState>) -> Self {
        state.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight { state }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

fn validate_chat_payload(payload: &Value) -> Result<String, ProxyError> {
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ProxyError::InvalidRequest("'model' is required and must be a string".to_string()))?;

    let messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| ProxyError::InvalidRequest("'messages' is required and must be an array".to_string()))?;
    if messages.is_empty() {
        return Err(ProxyError::InvalidRequest(
            "'messages' must not be empty".to_string(),
        ));
    }
    Ok(model.to_string())
}

/// Pulls a human message out of an upstream error body without forwarding
/// the body itself.
fn upstream_error_message(body: &[u8]) -> String {
    if let Ok(v) = serde_json::from_slice::<Value>(body) {
        for pointer in ["/error/message", "/message", "/error"] {
            if let Some(msg) = v.pointer(pointer).and_then(Value::as_str) {
                return msg.to_string();
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.chars().take(300).collect()
    }
}

fn classify_upstream_status(status: StatusCode, body: &[u8]) -> ProxyError {
    let message = upstream_error_message(body);
    match status.as_u16() {
        401 | 403 => ProxyError::UpstreamAuth(message),
        429 => ProxyError::RateLimited(message),
        400..=499 => ProxyError::InvalidRequest(message),
        _ => ProxyError::Upstream(message),
    }
}

fn gunzip_if_needed(headers: &reqwest::header::HeaderMap, body: Bytes) -> Bytes {
    let is_gzip = headers
        .get(reqwest::header::CONTENT_ENCODING)
        .map_or(false, |v| v.to_str().unwrap_or("").contains("gzip"));
    if !is_gzip || body.is_empty() {
        return body;
    }
    let mut decoder = GzDecoder::new(&body[..]);
    let mut decompressed = Vec::new();
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => Bytes::from(decompressed),
        Err(e) => {
            error!(error = %e, "gzip decode of upstream body failed, passing original");
            body
        }
    }
}

/// Full chat relay: resolve → filter → translate → dispatch → relay →
/// meter. Always returns a response; every exit path leaves one usage row.
pub async fn relay_chat(
    state: Arc<AppState>,
    kind: EndpointKind,
    route: &'static str,
    client_ip: String,
    payload: Value,
) -> Response {
    let in_flight = InFlight::new(state.clone());
    let requested = payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut meter = RequestMeter::new(state.recorder.clone(), route, client_ip, requested);

    match relay_chat_inner(&state, kind, &payload, &mut meter, in_flight).await {
        Ok(response) => response,
        Err(err) => {
            error!(kind = err.error_type(), error = %err, "request failed");
            meter.finish_error(err.usage_status(), &err.to_string(), TokenUsage::default());
            err.into_response()
        }
    }
}

async fn relay_chat_inner(
    state: &Arc<AppState>,
    kind: EndpointKind,
    payload: &Value,
    meter: &mut RequestMeter,
    in_flight: InFlight,
) -> Result<Response, ProxyError> {
    let model = validate_chat_payload(payload)?;
    meter.set_public_name(&model);

    // One snapshot per request: a concurrent reload never changes the
    // target mid-flight.
    let snapshot = state.snapshot.load();
    let target = snapshot
        .resolve(&model)
        .ok_or_else(|| ProxyError::ModelNotFound(model.clone()))?;
    if !target.visible_on(kind) {
        return Err(ProxyError::NotAvailableOnEndpoint(model.clone()));
    }
    meter.set_target(&target);

    let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let upstream = adapters::translate_request(payload, &target, stream)
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    let input_estimate = adapters::estimate_input_tokens(payload);

    debug!(url = %upstream.url, model = %target.model_name, stream, "dispatching upstream request");

    let request = state
        .http
        .post(&upstream.url)
        .headers(upstream.headers)
        .body(upstream.body)
        .timeout(state.upstream_timeout);

    // TTFB bound: the send resolves once upstream response headers arrive.
    let response = match tokio::time::timeout(state.ttfb_timeout, request.send()).await {
        Err(_) => return Err(ProxyError::Timeout(state.ttfb_timeout.as_millis())),
        Ok(Err(e)) if e.is_timeout() => {
            return Err(ProxyError::Timeout(state.upstream_timeout.as_millis()))
        }
        Ok(Err(e)) => return Err(ProxyError::Upstream(format!("upstream request failed: {e}"))),
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.bytes().await.unwrap_or_default();
        return Err(classify_upstream_status(status, &body));
    }

    let is_sse = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .map_or(false, |v| v.to_str().unwrap_or("").contains("text/event-stream"));

    if stream && is_sse {
        Ok(relay_streaming(state, response, &target, meter_take(meter), input_estimate, in_flight))
    } else {
        let result =
            relay_buffered(response, &target, input_estimate, state.upstream_timeout.as_millis())
                .await;
        drop(in_flight);
        match result {
            Ok((body, usage)) => {
                meter_take(meter).finish_success(usage);
                Ok(Json(body).into_response())
            }
            Err(e) => Err(e),
        }
    }
}

/// The pipeline borrows the meter for early failures; successful relays
/// consume it. Swapping out a fresh placeholder keeps both paths honest.
fn meter_take(meter: &mut RequestMeter) -> RequestMeter {
    std::mem::replace(
        meter,
        RequestMeter {
            recorder: meter.recorder.clone(),
            started: meter.started,
            route: meter.route,
            client_ip: String::new(),
            public_name: String::new(),
            config_id: None,
        },
    )
}

async fn relay_buffered(
    response: reqwest::Response,
    target: &Arc<RouteTarget>,
    input_estimate: i32,
    total_timeout_ms: u128,
) -> Result<(Value, TokenUsage), ProxyError> {
    let headers = response.headers().clone();
    let raw = response
        .bytes()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout(total_timeout_ms)
            } else {
                ProxyError::Upstream(format!("failed to read upstream body: {e}"))
            }
        })?;
    let raw = gunzip_if_needed(&headers, raw);

    let body: Value = serde_json::from_slice(&raw)
        .map_err(|e| ProxyError::Upstream(format!("upstream returned invalid JSON: {e}")))?;
    Ok(adapters::translate_response(body, target, input_estimate))
}

fn relay_streaming(
    state: &Arc<AppState>,
    response: reqwest::Response,
    target: &Arc<RouteTarget>,
    meter: RequestMeter,
    input_estimate: i32,
    in_flight: InFlight,
) -> Response {
    let mut translator = ChunkTranslator::new(target, input_estimate);
    let upstream_timeout_ms = state.upstream_timeout.as_millis();
    let public_name = target.public_name.clone();

    let body_stream = async_stream::stream! {
        let _in_flight = in_flight;
        let mut guard = StreamGuard { meter: Some(meter), usage: TokenUsage::default() };
        let mut parser = SseParser::new();
        let mut upstream = response.bytes_stream();

        while let Some(next) = upstream.next().await {
            match next {
                Ok(chunk) => {
                    for event in parser.feed(&chunk) {
                        for translated in translator.translate(event) {
                            guard.usage = translator.usage();
                            yield Ok::<Bytes, std::io::Error>(translated.to_bytes());
                        }
                    }
                }
                Err(e) => {
                    // Mid-stream upstream failure: terminate the SSE cleanly
                    // and account for what made it through.
                    let status = if e.is_timeout() {
                        UsageStatus::Timeout
                    } else {
                        UsageStatus::UpstreamError
                    };
                    let message = if e.is_timeout() {
                        format!("upstream stream timed out after {upstream_timeout_ms} ms")
                    } else {
                        format!("upstream stream failed: {e}")
                    };
                    warn!(public_name = %public_name, %message, "stream interrupted");
                    guard.finish_error(status, &message, translator.usage());
                    yield Ok(SseEvent::data("[DONE]").to_bytes());
                    return;
                }
            }
        }

        guard.finish_success(translator.usage());
        yield Ok(SseEvent::data("[DONE]").to_bytes());
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .expect("static headers are valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_payload_validation() {
        assert!(validate_chat_payload(&json!({"model": "m", "messages": [{"role": "user", "content": "x"}]})).is_ok());
        assert!(validate_chat_payload(&json!({"messages": [{}]})).is_err());
        assert!(validate_chat_payload(&json!({"model": "m"})).is_err());
        assert!(validate_chat_payload(&json!({"model": "m", "messages": []})).is_err());
        assert!(validate_chat_payload(&json!({"model": 42, "messages": [{}]})).is_err());
    }

    #[test]
    fn upstream_error_messages_are_extracted_not_forwarded() {
        let openai_shaped = br#"{"error": {"message": "invalid key", "type": "auth"}}"#;
        assert_eq!(upstream_error_message(openai_shaped), "invalid key");

        let plain = b"Bad Gateway";
        assert_eq!(upstream_error_message(plain), "Bad Gateway");

        assert_eq!(upstream_error_message(b""), "no response body");
    }

    #[test]
    fn upstream_status_classification() {
        let err = classify_upstream_status(StatusCode::UNAUTHORIZED, b"{}");
        assert!(matches!(err, ProxyError::UpstreamAuth(_)));
        let err = classify_upstream_status(StatusCode::TOO_MANY_REQUESTS, b"{}");
        assert!(matches!(err, ProxyError::RateLimited(_)));
        let err = classify_upstream_status(StatusCode::UNPROCESSABLE_ENTITY, b"{}");
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
        let err = classify_upstream_status(StatusCode::INTERNAL_SERVER_ERROR, b"{}");
        assert!(matches!(err, ProxyError::Upstream(_)));
    }
}
