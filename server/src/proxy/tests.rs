use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use futures::stream;
use serde_json::{json, Value};

use crate::database::stat;
use crate::database::usage_record::UsageRecord;
use crate::database::Db;
use crate::proxy::create_proxy_router;
use crate::schema::enum_def::{ServiceType, UsageStatus};
use crate::service::config_service::{ConfigService, CreateConfigRequest};
use crate::service::secrets::SecretCipher;
use crate::service::snapshot::{EndpointKind, SnapshotHandle};
use crate::service::usage::UsageRecorder;
use crate::service::AppState;

struct Harness {
    _tmp: tempfile::TempDir,
    db: Db,
    configs: ConfigService,
    general_url: String,
    special_url: String,
}

async fn serve(router: Router<Arc<AppState>>, state: Arc<AppState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        axum::serve(
            listener,
            router
                .with_state(state)
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future(),
    );
    format!("http://{addr}")
}

async fn harness() -> Harness {
    harness_with_timeouts(Duration::from_secs(30), Duration::from_secs(10)).await
}

async fn harness_with_timeouts(total: Duration, ttfb: Duration) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let db = Db::establish(&tmp.path().join("bridge.db")).unwrap();
    let cipher = SecretCipher::load_or_create(&tmp.path().join(".encryption_key")).unwrap();
    let snapshot = Arc::new(SnapshotHandle::empty());
    let configs = ConfigService::new(db.clone(), cipher, snapshot.clone());
    configs.reload().unwrap();
    let recorder = UsageRecorder::spawn(db.clone());
    let state = AppState::with_timeouts(db.clone(), configs.clone(), snapshot, recorder, total, ttfb);

    let general_url = serve(create_proxy_router(EndpointKind::General), state.clone()).await;
    let special_url = serve(create_proxy_router(EndpointKind::Special), state.clone()).await;

    Harness {
        _tmp: tmp,
        db,
        configs,
        general_url,
        special_url,
    }
}

fn seed_config(harness: &Harness, public_name: &str, base_url: &str, general: bool, special: bool) {
    harness
        .configs
        .create(CreateConfigRequest {
            service_type: ServiceType::OpenaiCompatible,
            public_name: public_name.to_string(),
            model_name: format!("{public_name}-0613"),
            api_key: "sk-secret".to_string(),
            base_url: base_url.to_string(),
            is_enabled: true,
            available_on_general: general,
            available_on_special: special,
            notes: String::new(),
        })
        .unwrap();
}

fn chat_body(model: &str) -> Value {
    json!({"model": model, "messages": [{"role": "user", "content": "hi"}]})
}

async fn wait_for_usage_rows(db: &Db, expected: i64) -> Vec<UsageRecord> {
    for _ in 0..60 {
        if UsageRecord::count(db).unwrap() >= expected {
            return UsageRecord::list_recent(db, expected).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("usage rows never reached {expected}");
}

/// A stand-in OpenAI-compatible upstream.
async fn mock_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, router).into_future());
    format!("http://{addr}")
}

fn upstream_completion(model: &str) -> Value {
    json!({
        "id": "chatcmpl-up",
        "object": "chat.completion",
        "model": model,
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
    })
}

#[tokio::test]
async fn unknown_model_returns_wire_exact_404_and_records() {
    let h = harness().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/chat/completions", h.general_url))
        .json(&chat_body("gpt-4"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"error": {
            "message": "Model 'gpt-4' not found",
            "type": "invalid_request_error",
            "param": "model",
            "code": "model_not_found",
        }})
    );

    let rows = wait_for_usage_rows(&h.db, 1).await;
    assert_eq!(rows[0].public_name, "gpt-4");
    assert_eq!(rows[0].status, UsageStatus::ClientError);
    assert_eq!(rows[0].total_tokens, 0);
}

#[tokio::test]
async fn endpoint_filter_isolates_general_from_special() {
    let h = harness().await;
    let upstream = mock_upstream(Router::new().route(
        "/chat/completions",
        post(|| async { Json(upstream_completion("secret-4-0613")) }),
    ))
    .await;
    seed_config(&h, "secret-4", &upstream, false, true);

    let client = reqwest::Client::new();

    let forbidden = client
        .post(format!("{}/v1/chat/completions", h.general_url))
        .json(&chat_body("secret-4"))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), 403);
    let body: Value = forbidden.json().await.unwrap();
    assert_eq!(body["error"]["type"], "permission_denied");

    let allowed = client
        .post(format!("{}/v1/chat/completions", h.special_url))
        .json(&chat_body("secret-4"))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    let body: Value = allowed.json().await.unwrap();
    assert_eq!(body["model"], "secret-4");

    // The refused request still left a zero-token client_error row.
    let rows = wait_for_usage_rows(&h.db, 2).await;
    let refused = rows
        .iter()
        .find(|r| r.status == UsageStatus::ClientError)
        .expect("403 row present");
    assert_eq!(refused.public_name, "secret-4");
    assert_eq!(refused.input_tokens, 0);
    assert_eq!(refused.output_tokens, 0);
}

#[tokio::test]
async fn model_listing_tracks_endpoint_visibility() {
    let h = harness().await;
    seed_config(&h, "everywhere", "http://127.0.0.1:1/v1", true, true);
    seed_config(&h, "special-only", "http://127.0.0.1:1/v1", false, true);

    let client = reqwest::Client::new();
    let names = |body: Value| -> Vec<String> {
        body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap().to_string())
            .collect()
    };

    let general: Value = client
        .get(format!("{}/v1/models", h.general_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(general["object"], "list");
    assert_eq!(names(general), vec!["everywhere"]);

    let special: Value = client
        .get(format!("{}/v1/models", h.special_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names(special), vec!["everywhere", "special-only"]);
}

#[tokio::test]
async fn streaming_rewrites_model_and_terminates_once() {
    let h = harness().await;

    let upstream = mock_upstream(Router::new().route(
        "/chat/completions",
        post(|| async {
            let chunk = |text: &str| {
                json!({
                    "id": "chatcmpl-up",
                    "object": "chat.completion.chunk",
                    "model": "gpt-4-0613",
                    "choices": [{"index": 0, "delta": {"content": text}}]
                })
                .to_string()
            };
            let frames = vec![
                Ok::<Event, std::convert::Infallible>(Event::default().data(chunk("one"))),
                Ok(Event::default().data(chunk("two"))),
                Ok(Event::default().data(chunk("three"))),
                Ok(Event::default().data("[DONE]")),
            ];
            Sse::new(stream::iter(frames)).into_response()
        }),
    ))
    .await;
    seed_config(&h, "gpt-4", &upstream, true, true);

    let mut body = chat_body("gpt-4");
    body["stream"] = json!(true);

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", h.general_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("text/event-stream"));

    let raw = response.text().await.unwrap();
    let data_lines: Vec<&str> = raw
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();

    // three content chunks then exactly one [DONE], nothing after it
    assert_eq!(data_lines.len(), 4);
    assert_eq!(*data_lines.last().unwrap(), "[DONE]");
    for line in &data_lines[..3] {
        let chunk: Value = serde_json::from_str(line).unwrap();
        assert_eq!(chunk["model"], "gpt-4");
    }
    assert!(!raw.contains("gpt-4-0613"));

    let rows = wait_for_usage_rows(&h.db, 1).await;
    assert_eq!(rows[0].status, UsageStatus::Success);
    assert_eq!(rows[0].total_tokens, rows[0].input_tokens + rows[0].output_tokens);
}

#[tokio::test]
async fn ttfb_timeout_maps_to_504_and_timeout_row() {
    let h = harness_with_timeouts(Duration::from_secs(30), Duration::from_secs(1)).await;

    let upstream = mock_upstream(Router::new().route(
        "/chat/completions",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(upstream_completion("slow-0613"))
        }),
    ))
    .await;
    seed_config(&h, "slow", &upstream, true, true);

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", h.general_url))
        .json(&chat_body("slow"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "timeout");

    let rows = wait_for_usage_rows(&h.db, 1).await;
    assert_eq!(rows[0].status, UsageStatus::Timeout);
    assert!(rows[0].response_time_ms >= 1000);
}

#[tokio::test]
async fn hot_reload_removes_disabled_model_atomically() {
    let h = harness().await;
    let upstream = mock_upstream(Router::new().route(
        "/chat/completions",
        post(|| async { Json(upstream_completion("gpt-4-0613")) }),
    ))
    .await;
    seed_config(&h, "gpt-4", &upstream, true, true);

    let client = reqwest::Client::new();
    let ok = client
        .post(format!("{}/v1/chat/completions", h.general_url))
        .json(&chat_body("gpt-4"))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    // Disable and reload; the snapshot swap is one atomic publication.
    let id = h.configs.list().unwrap()[0].id;
    h.configs
        .update(
            id,
            crate::service::config_service::UpdateConfigRequest {
                is_enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();

    let listing: Value = client
        .get(format!("{}/v1/models", h.general_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listing["data"].as_array().unwrap().is_empty());

    let gone = client
        .post(format!("{}/v1/chat/completions", h.general_url))
        .json(&chat_body("gpt-4"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn upstream_5xx_maps_to_502_without_leaking_the_body() {
    let h = harness().await;
    let upstream = mock_upstream(Router::new().route(
        "/chat/completions",
        post(|| async {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"message": "backend exploded", "internal_trace": "secret"}})),
            )
        }),
    ))
    .await;
    seed_config(&h, "fragile", &upstream, true, true);

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", h.general_url))
        .json(&chat_body("fragile"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "upstream_error");
    // message text carried over, upstream body structure not forwarded
    assert!(body["error"]["message"].as_str().unwrap().contains("backend exploded"));
    assert!(body.get("internal_trace").is_none());

    let rows = wait_for_usage_rows(&h.db, 1).await;
    assert_eq!(rows[0].status, UsageStatus::UpstreamError);
    assert!(rows[0].error_message.is_some());
}

#[tokio::test]
async fn legacy_completions_synthesises_chat() {
    let h = harness().await;
    let upstream = mock_upstream(Router::new().route(
        "/chat/completions",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["messages"][0]["role"], "user");
            assert_eq!(body["messages"][0]["content"], "Once upon a time");
            Json(upstream_completion("gpt-4-0613"))
        }),
    ))
    .await;
    seed_config(&h, "gpt-4", &upstream, true, true);

    let response = reqwest::Client::new()
        .post(format!("{}/v1/completions", h.general_url))
        .json(&json!({"model": "gpt-4", "prompt": "Once upon a time"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["model"], "gpt-4");
}

#[tokio::test]
async fn client_leaderboard_orders_by_tokens() {
    let h = harness().await;

    // 60 requests from 1.2.3.4 totalling 6000 tokens, 40 from 5.6.7.8
    // totalling 8000: the smaller-count client leads.
    let mut batch = Vec::new();
    for i in 0..100 {
        let (ip, total) = if i < 60 { ("1.2.3.4", 100) } else { ("5.6.7.8", 200) };
        batch.push(crate::database::usage_record::NewUsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: 1_000 + i,
            client_ip: ip.to_string(),
            public_name: "gpt-4".to_string(),
            config_id: None,
            input_tokens: total / 2,
            output_tokens: total / 2,
            total_tokens: total,
            response_time_ms: 10,
            status: UsageStatus::Success,
            error_message: None,
        });
    }
    UsageRecord::insert_batch(&h.db, &batch).unwrap();

    let board = stat::client_leaderboard(&h.db, 0, i64::MAX, 10).unwrap();
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].key, "5.6.7.8");
    assert_eq!(board[0].total_tokens, 8000);
    assert_eq!(board[1].key, "1.2.3.4");
    assert_eq!(board[1].total_tokens, 6000);
}
