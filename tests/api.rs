use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::post;
use http_body_util::BodyExt;
use minirouter::config::{ApiKeyConfig, GatewayConfig, ModelConfig};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;

const CLIENT_KEY: &str = "sk-test-client";

#[derive(Clone, Default)]
struct Captured {
    bodies: Arc<Mutex<Vec<(String, Value)>>>,
    auth: Arc<Mutex<Vec<String>>>,
}

impl Captured {
    fn bodies_for(&self, backend: &str) -> Vec<Value> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, _)| b == backend)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn backends_hit(&self) -> Vec<String> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .map(|(b, _)| b.clone())
            .collect()
    }

    fn auth_headers(&self) -> Vec<String> {
        self.auth.lock().unwrap().clone()
    }
}

struct TestContext {
    router: axum::Router,
    captured: Captured,
}

fn chunk(id: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "upstream-model",
        "provider": "internal-pool-3",
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }]
    })
}

fn usage_chunk(id: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "upstream-model",
        "choices": [],
        "usage": { "prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11 }
    })
}

fn sse_response(chunks: Vec<Value>, first_delay: Duration) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(16);
    tokio::spawn(async move {
        tokio::time::sleep(first_delay).await;
        for c in chunks {
            if tx.send(Ok(Event::default().data(c.to_string()))).await.is_err() {
                return;
            }
        }
        let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
    });
    Sse::new(ReceiverStream::new(rx)).into_response()
}

async fn chat(
    State(captured): State<Captured>,
    Path(backend): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        captured.auth.lock().unwrap().push(auth.to_string());
    }
    captured
        .bodies
        .lock()
        .unwrap()
        .push((backend.clone(), body.clone()));
    let stream = body.get("stream").and_then(Value::as_bool) == Some(true);

    match backend.as_str() {
        b if b.starts_with("fail") => {
            (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response()
        }
        "quota" => Json(json!({ "error": { "message": "quota exceeded" } })).into_response(),
        "garbage" => (StatusCode::OK, "<html>not json</html>").into_response(),
        "stream-only" if !stream => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": "streaming required" } })),
        )
            .into_response(),
        "stream-only" | "ok" | "slow" if stream => {
            let delay = if backend == "slow" {
                Duration::from_millis(1_200)
            } else {
                Duration::ZERO
            };
            sse_response(
                vec![
                    chunk("chatcmpl-s", json!({ "role": "assistant", "content": "Hel" }), None),
                    chunk("chatcmpl-s", json!({ "content": "lo" }), None),
                    chunk("chatcmpl-s", json!({}), Some("stop")),
                    usage_chunk("chatcmpl-s"),
                ],
                delay,
            )
        }
        _ => Json(json!({
            "id": format!("chatcmpl-{backend}"),
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": body.get("model").cloned().unwrap_or(Value::Null),
            "provider": "internal-pool-3",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": format!("hello from {backend}") },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12 }
        }))
        .into_response(),
    }
}

async fn start_upstream() -> (SocketAddr, Captured) {
    let captured = Captured::default();
    let router = axum::Router::new()
        .route("/{backend}/chat/completions", post(chat))
        .route(
            "/direct",
            post(
                |State(captured): State<Captured>, Json(body): Json<Value>| async move {
                    captured
                        .bodies
                        .lock()
                        .unwrap()
                        .push(("direct".to_string(), body));
                    Json(json!({ "id": "direct-1", "object": "chat.completion", "choices": [] }))
                },
            ),
        )
        .with_state(captured.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, captured)
}

fn model(name: &str, upstream: &str, base_url: String) -> ModelConfig {
    ModelConfig {
        name: name.to_string(),
        provider_model_name: upstream.to_string(),
        display_name: name.to_uppercase(),
        base_url,
        enabled: true,
        visible: true,
        supports_completion: true,
        ..ModelConfig::default()
    }
}

async fn setup_with(build: impl FnOnce(&str) -> Vec<ModelConfig>) -> TestContext {
    let (addr, captured) = start_upstream().await;
    let base = format!("http://{addr}");
    let config = GatewayConfig {
        models: build(&base),
        api_keys: vec![
            ApiKeyConfig {
                id: 1,
                key: CLIENT_KEY.to_string(),
                name: "tests".to_string(),
                is_active: true,
                ..ApiKeyConfig::default()
            },
            ApiKeyConfig {
                id: 2,
                key: "sk-disabled".to_string(),
                is_active: false,
                ..ApiKeyConfig::default()
            },
        ],
        ..GatewayConfig::default()
    };
    let runtime = minirouter::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        config_path: "unused.yaml".into(),
    };
    let state = minirouter::app::state_from_config(runtime, config).expect("state");
    TestContext {
        router: minirouter::app::build_app(state),
        captured,
    }
}

async fn send(ctx: &TestContext, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

async fn chat_post(ctx: &TestContext, body: Value) -> (StatusCode, HeaderMap, String) {
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {CLIENT_KEY}"))
        .body(Body::from(body.to_string()))
        .unwrap();
    send(ctx, req).await
}

fn chat_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "stream": stream,
        "messages": [{ "role": "user", "content": "hi" }]
    })
}

fn data_frames(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn failover_returns_second_candidate_with_its_usage() {
    let ctx = setup_with(|base| {
        vec![
            model("chat", "broken-upstream", format!("{base}/fail")),
            model("chat", "good-upstream", format!("{base}/ok")),
        ]
    })
    .await;

    let (status, headers, body) = chat_post(&ctx, chat_body("chat", false)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(headers[CONTENT_TYPE], "application/json; charset=utf-8");
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["id"], "chatcmpl-ok");
    assert_eq!(body["model"], "chat");
    assert!(body.get("provider").is_none());
    assert_eq!(body["usage"]["total_tokens"], 12);

    let sent = ctx.captured.bodies_for("ok");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["model"], "good-upstream");
    assert!(sent[0].get("stream_options").is_none());
    assert_eq!(ctx.captured.bodies_for("fail").len(), 1);
}

#[tokio::test]
async fn all_candidates_failing_is_503_with_last_error() {
    let ctx = setup_with(|base| {
        vec![
            model("chat", "a", format!("{base}/garbage")),
            model("chat", "b", format!("{base}/fail")),
        ]
    })
    .await;

    let (status, _, body) = chat_post(&ctx, chat_body("chat", false)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_str(&body).unwrap();
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.starts_with("all providers failed: "), "{message}");
    assert!(message.contains("500"), "{message}");
    assert!(message.contains("upstream exploded"), "{message}");
    assert_eq!(body["error"]["code"], "all_providers_failed");
}

#[tokio::test]
async fn rotation_advances_even_when_every_candidate_fails() {
    let ctx = setup_with(|base| {
        vec![
            model("chat", "a", format!("{base}/fail-a")),
            model("chat", "b", format!("{base}/fail-b")),
            model("chat", "c", format!("{base}/fail-c")),
        ]
    })
    .await;

    for _ in 0..4 {
        let (status, _, _) = chat_post(&ctx, chat_body("chat", false)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    let hits = ctx.captured.backends_hit();
    assert_eq!(hits.len(), 12);
    let first_hits: Vec<&str> = hits.chunks(3).map(|round| round[0].as_str()).collect();
    assert_eq!(first_hits, vec!["fail-a", "fail-b", "fail-c", "fail-a"]);
    assert_eq!(&hits[3..6], &["fail-b", "fail-c", "fail-a"]);
}

#[tokio::test]
async fn unknown_model_is_404() {
    let ctx = setup_with(|base| vec![model("chat", "a", format!("{base}/ok"))]).await;
    let (status, _, body) = chat_post(&ctx, chat_body("nope", false)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        body["error"]["message"],
        "model nope not found or not available"
    );
}

#[tokio::test]
async fn auth_failures_are_401() {
    let ctx = setup_with(|base| vec![model("chat", "a", format!("{base}/ok"))]).await;
    for (header, code) in [
        (None, "missing_api_key"),
        (Some("Bearer sk-who"), "invalid_api_key"),
        (Some("Bearer sk-disabled"), "invalid_api_key"),
    ] {
        let mut req = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(CONTENT_TYPE, "application/json");
        if let Some(header) = header {
            req = req.header(AUTHORIZATION, header);
        }
        let req = req
            .body(Body::from(chat_body("chat", false).to_string()))
            .unwrap();
        let (status, _, body) = send(&ctx, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["error"]["code"], code);
    }
    assert!(ctx.captured.bodies_for("ok").is_empty());
}

#[tokio::test]
async fn malformed_requests_are_400() {
    let ctx = setup_with(|base| vec![model("chat", "a", format!("{base}/ok"))]).await;
    let (status, _, body) = chat_post(&ctx, json!({ "model": "chat", "messages": "hi" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("`messages`"), "{body}");

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(AUTHORIZATION, format!("Bearer {CLIENT_KEY}"))
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, _) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(ctx.captured.bodies_for("ok").is_empty());
}

#[tokio::test]
async fn streaming_relays_rewritten_frames() {
    let ctx = setup_with(|base| vec![model("chat", "good-upstream", format!("{base}/ok"))]).await;
    let (status, headers, body) = chat_post(&ctx, chat_body("chat", true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CONTENT_TYPE], "text/event-stream");

    let frames = data_frames(&body);
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
    let first: Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(first["model"], "chat");
    assert!(first.get("provider").is_none());
    assert_eq!(first["choices"][0]["delta"]["content"], "Hel");

    let sent = ctx.captured.bodies_for("ok");
    assert_eq!(sent[0]["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn streaming_falls_back_before_first_byte() {
    let ctx = setup_with(|base| {
        vec![
            model("chat", "a", format!("{base}/fail")),
            model("chat", "b", format!("{base}/ok")),
        ]
    })
    .await;
    let (status, _, body) = chat_post(&ctx, chat_body("chat", true)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.ends_with("data: [DONE]\n\n"), "{body}");
    assert!(!body.contains("\"error\""));
}

#[tokio::test]
async fn streaming_skips_candidate_answering_plain_json() {
    let ctx = setup_with(|base| {
        vec![
            model("chat", "a", format!("{base}/quota")),
            model("chat", "b", format!("{base}/ok")),
        ]
    })
    .await;
    let (status, headers, body) = chat_post(&ctx, chat_body("chat", true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
    assert!(!body.contains("quota exceeded"), "{body}");
    assert!(body.ends_with("data: [DONE]\n\n"), "{body}");

    let frames = data_frames(&body);
    let first: Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
    assert_eq!(ctx.captured.bodies_for("quota").len(), 1);
    assert_eq!(ctx.captured.bodies_for("ok").len(), 1);
}

#[tokio::test]
async fn streaming_with_no_healthy_candidate_is_503_json() {
    let ctx = setup_with(|base| vec![model("chat", "a", format!("{base}/fail"))]).await;
    let (status, headers, body) = chat_post(&ctx, chat_body("chat", true)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[CONTENT_TYPE], "application/json");
    assert!(body.contains("all providers failed"));
}

#[tokio::test]
async fn slow_upstream_gets_heartbeats() {
    let ctx = setup_with(|base| vec![model("chat", "a", format!("{base}/slow"))]).await;
    let (status, _, body) = chat_post(&ctx, chat_body("chat", true)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with(": MINIROUTER PROCESSING\n\n"), "{body}");
    assert!(body.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn stream_only_backend_is_aggregated() {
    let ctx = setup_with(|base| {
        let mut m = model("chat", "streamer", format!("{base}/stream-only"));
        m.stream_only = true;
        vec![m]
    })
    .await;

    let (status, _, body) = chat_post(&ctx, chat_body("chat", false)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "chat");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 11);

    let sent = ctx.captured.bodies_for("stream-only");
    assert_eq!(sent[0]["stream"], true);
}

#[tokio::test]
async fn upstream_keys_rotate_per_request() {
    let ctx = setup_with(|base| {
        let mut m = model("chat", "a", format!("{base}/ok"));
        m.provider_api_key = vec!["k1".to_string(), "k2".to_string()];
        vec![m]
    })
    .await;
    for _ in 0..3 {
        let (status, _, _) = chat_post(&ctx, chat_body("chat", false)).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(
        ctx.captured.auth_headers(),
        vec!["Bearer k1", "Bearer k2", "Bearer k1"]
    );
}

#[tokio::test]
async fn direct_base_url_used_verbatim() {
    let ctx = setup_with(|base| {
        let mut m = model("chat", "a", format!("{base}/direct"));
        m.base_url_direct = true;
        vec![m]
    })
    .await;
    let (status, _, body) = chat_post(&ctx, chat_body("chat", false)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(ctx.captured.bodies_for("direct").len(), 1);
}

#[tokio::test]
async fn provider_field_stripped_before_forwarding() {
    let ctx = setup_with(|base| vec![model("chat", "a", format!("{base}/ok"))]).await;
    let mut body = chat_body("chat", false);
    body["provider"] = json!(["Alpha"]);
    let (status, _, _) = chat_post(&ctx, body).await;
    assert_eq!(status, StatusCode::OK);
    let sent = ctx.captured.bodies_for("ok");
    assert!(sent[0].get("provider").is_none());
}

#[tokio::test]
async fn models_listing_filters_and_dedups() {
    let ctx = setup_with(|base| {
        let mut hidden = model("hidden", "h", format!("{base}/ok"));
        hidden.visible = false;
        let mut disabled = model("off", "o", format!("{base}/ok"));
        disabled.enabled = false;
        let mut first = model("chat", "a", format!("{base}/ok"));
        first.description = "first wins".to_string();
        first.input_price_per_token = 0.000_001_5;
        vec![
            first,
            model("chat", "b", format!("{base}/ok")),
            hidden,
            disabled,
        ]
    })
    .await;

    let req = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["id"], "chat");
    assert_eq!(data[0]["name"], "CHAT");
    assert_eq!(data[0]["description"], "first wins");
    assert_eq!(data[0]["pricing"]["prompt"], "0.0000015");
    assert_eq!(data[0]["architecture"]["modality"], "text->text");
}

#[tokio::test]
async fn health_reports_ok() {
    let ctx = setup_with(|_| Vec::new()).await;
    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-request-id"));
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["time"].as_str().is_some());
}
