//! Integration tests for the ferry-web server.
//!
//! These tests start a real axum server on a random port, backed by a
//! scripted model backend, and exercise the REST and SSE endpoints.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry::api::{ChunkStream, RawFailure};
use ferry::client::BackendFuture;
use ferry::prelude::*;
use ferry_web::{WebConfig, spawn_web};
use futures::StreamExt;

// ── Fakes ────────────────────────────────────────────────────────────

type StreamScript = Result<Vec<Result<Chunk, RawFailure>>, RawFailure>;

#[derive(Default)]
struct ScriptedBackend {
    completions: Mutex<VecDeque<Result<Completion, RawFailure>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    /// Upstream for the next stream call when no script is queued.
    live: Mutex<Option<futures::channel::mpsc::UnboundedReceiver<Result<Chunk, RawFailure>>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedBackend {
    fn replies(texts: &[&str]) -> Self {
        let completions = texts
            .iter()
            .map(|t| {
                Ok(Completion {
                    chunks: vec![Chunk::text(*t)],
                    usage: None,
                })
            })
            .collect();
        Self {
            completions: Mutex::new(completions),
            ..Default::default()
        }
    }

    fn failing(raw: RawFailure) -> Self {
        Self {
            completions: Mutex::new(VecDeque::from([Err(raw)])),
            ..Default::default()
        }
    }

    fn streams(items: Vec<StreamScript>) -> Self {
        Self {
            streams: Mutex::new(items.into()),
            ..Default::default()
        }
    }
}

impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete<'a>(&'a self, request: &'a GenerateRequest) -> BackendFuture<'a, Completion> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.completions.lock().unwrap().pop_front();
        Box::pin(async move { next.unwrap_or_else(|| Err(RawFailure::new("script exhausted"))) })
    }

    fn stream<'a>(&'a self, request: &'a GenerateRequest) -> BackendFuture<'a, ChunkStream> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.streams.lock().unwrap().pop_front();
        let live = self.live.lock().unwrap().take();
        Box::pin(async move {
            match (next, live) {
                (Some(Ok(items)), _) => Ok(futures::stream::iter(items).boxed()),
                (Some(Err(raw)), _) => Err(raw),
                (None, Some(rx)) => Ok(rx.boxed()),
                (None, None) => Err(RawFailure::new("script exhausted")),
            }
        })
    }
}

struct MissingKey;

impl BackendFactory for MissingKey {
    fn create(&self) -> Result<Arc<dyn ModelBackend>, ClassifiedError> {
        Err(ClassifiedError::missing_config(
            "API key missing: FERRY_API_KEY is not set",
        ))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

async fn spawn_with(assistant: Assistant, body_limit: usize) -> String {
    let config = WebConfig {
        bind_addr: ([127, 0, 0, 1], 0).into(),
        body_limit,
    };
    let addr = spawn_web(Arc::new(assistant), config).await.unwrap();
    format!("http://{addr}")
}

/// Spawn a server on a random port with retries disabled.
async fn spawn_test_server(backend: ScriptedBackend) -> (Arc<ScriptedBackend>, String) {
    let backend = Arc::new(backend);
    let shared: Arc<dyn ModelBackend> = backend.clone();
    let assistant = Assistant::new(FixedBackend(shared)).with_policy(RetryPolicy::no_retry());
    let base = spawn_with(assistant, ferry_web::DEFAULT_BODY_LIMIT).await;
    (backend, base)
}

async fn post_json(url: String, body: serde_json::Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .unwrap()
}

/// Parse a complete SSE body into `(event, data)` pairs, skipping comments.
fn parse_events(body: &str) -> Vec<(String, serde_json::Value)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data = serde_json::from_str(payload.trim()).ok();
                }
            }
            Some((event?, data?))
        })
        .collect()
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    let (_backend, base) = spawn_test_server(ScriptedBackend::default()).await;

    let resp = reqwest::get(format!("{base}/api/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn generate_returns_text() {
    let (backend, base) = spawn_test_server(ScriptedBackend::replies(&["{\"a\":1}"])).await;

    let resp = post_json(
        format!("{base}/api/generate"),
        serde_json::json!({
            "action": "generate",
            "prompt": "Give me JSON",
            "systemInstruction": "Be brief",
            "jsonMode": true,
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["text"], "{\"a\":1}");

    let requests = backend.requests.lock().unwrap();
    assert_eq!(requests[0].input, "Give me JSON");
    assert_eq!(requests[0].instructions.as_deref(), Some("Be brief"));
    assert!(requests[0].capabilities.json_output);
}

#[tokio::test]
async fn chat_forwards_history_and_image() {
    let (backend, base) = spawn_test_server(ScriptedBackend::replies(&["A cat."])).await;

    let resp = post_json(
        format!("{base}/api/generate"),
        serde_json::json!({
            "action": "chat",
            "history": [
                { "role": "user", "parts": [{ "text": "Hi" }] },
                { "role": "model", "parts": [{ "text": "Hello!" }] },
            ],
            "message": "What is this?",
            "image": "data:image/png;base64,AQID",
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["text"], "A cat.");

    let requests = backend.requests.lock().unwrap();
    assert_eq!(requests[0].history.len(), 2);
    assert_eq!(requests[0].input, "What is this?");
    let attachment = requests[0].attachment.as_ref().unwrap();
    assert_eq!(attachment.mime_type, "image/png");
    assert_eq!(attachment.data, vec![1, 2, 3]);
}

#[tokio::test]
async fn invalid_json_is_rejected() {
    let (_backend, base) = spawn_test_server(ScriptedBackend::default()).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/generate"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "invalid JSON payload");
}

#[tokio::test]
async fn unknown_action_is_rejected() {
    let (backend, base) = spawn_test_server(ScriptedBackend::default()).await;

    let resp = post_json(
        format!("{base}/api/generate"),
        serde_json::json!({ "action": "summarize", "prompt": "x" }),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert!(backend.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn get_on_generate_is_method_not_allowed() {
    let (_backend, base) = spawn_test_server(ScriptedBackend::default()).await;

    let resp = reqwest::get(format!("{base}/api/generate")).await.unwrap();
    assert_eq!(resp.status(), 405);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "method not allowed");
}

#[tokio::test]
async fn missing_key_is_server_error() {
    let base = spawn_with(Assistant::new(MissingKey), ferry_web::DEFAULT_BODY_LIMIT).await;

    let resp = post_json(
        format!("{base}/api/generate"),
        serde_json::json!({ "action": "generate", "prompt": "x" }),
    )
    .await;
    assert_eq!(resp.status(), 500);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["kind"], "missing_config");
    // The diagnostic stays in the server log.
    assert!(!json["error"].as_str().unwrap().contains("FERRY_API_KEY"));
}

#[tokio::test]
async fn rate_limit_maps_to_429() {
    let (_backend, base) = spawn_test_server(ScriptedBackend::failing(RawFailure::with_status(
        429,
        "Resource has been exhausted",
    )))
    .await;

    let resp = post_json(
        format!("{base}/api/generate"),
        serde_json::json!({ "action": "generate", "prompt": "x" }),
    )
    .await;
    assert_eq!(resp.status(), 429);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["kind"], "rate_limited");
}

#[tokio::test]
async fn blocked_content_maps_to_422() {
    let (_backend, base) = spawn_test_server(ScriptedBackend::failing(RawFailure::new(
        "response blocked (finish_reason: SAFETY)",
    )))
    .await;

    let resp = post_json(
        format!("{base}/api/generate"),
        serde_json::json!({ "action": "generate", "prompt": "x" }),
    )
    .await;
    assert_eq!(resp.status(), 422);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["kind"], "content_policy");
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let assistant = Assistant::new(FixedBackend::new(ScriptedBackend::default()));
    let base = spawn_with(assistant, 1024).await;

    let message = "x".repeat(4096);
    let resp = post_json(
        format!("{base}/api/generate"),
        serde_json::json!({ "action": "chat", "message": message }),
    )
    .await;
    assert_eq!(resp.status(), 413);
}

#[tokio::test]
async fn cors_preflight_allows_any_origin() {
    let (_backend, base) = spawn_test_server(ScriptedBackend::default()).await;

    let resp = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, format!("{base}/api/generate"))
        .header("Origin", "https://example.org")
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "content-type")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["access-control-allow-origin"].to_str().unwrap(),
        "*"
    );
}

// ── SSE Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_emits_chunks_then_done() {
    let (_backend, base) = spawn_test_server(ScriptedBackend::streams(vec![Ok(vec![
        Ok(Chunk::text("Hel")),
        Ok(Chunk::text("lo")),
    ])]))
    .await;

    let resp = post_json(
        format!("{base}/api/stream"),
        serde_json::json!({ "message": "Hi" }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let events = parse_events(&resp.text().await.unwrap());

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].0, "chunk");
    assert_eq!(events[0].1["type"], "text");
    assert_eq!(events[0].1["text"], "Hel");
    assert_eq!(events[1].1["text"], "lo");
    assert_eq!(events[2].0, "done");
    assert_eq!(events[2].1["state"], "completed");
    assert_eq!(events[2].1["chunks"], 2);
}

#[tokio::test]
async fn stream_failure_after_output_adds_notice() {
    let (_backend, base) = spawn_test_server(ScriptedBackend::streams(vec![Ok(vec![
        Ok(Chunk::text("Partial")),
        Err(RawFailure::new("connection reset by peer")),
    ])]))
    .await;

    let resp = post_json(
        format!("{base}/api/stream"),
        serde_json::json!({ "message": "Hi" }),
    )
    .await;
    let events = parse_events(&resp.text().await.unwrap());

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].1["text"], "Partial");
    assert_eq!(events[1].1["type"], "notice");
    assert_eq!(events[2].0, "done");
    assert_eq!(events[2].1["state"], "failed_after_output");
    assert_eq!(events[2].1["error"]["kind"], "network_failure");
}

#[tokio::test]
async fn stream_failure_before_output_is_error_event() {
    let (_backend, base) = spawn_test_server(ScriptedBackend::streams(vec![Err(
        RawFailure::with_status(503, "Service Unavailable"),
    )]))
    .await;

    let resp = post_json(
        format!("{base}/api/stream"),
        serde_json::json!({ "message": "Hi" }),
    )
    .await;
    let events = parse_events(&resp.text().await.unwrap());

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "error");
    assert_eq!(events[0].1["kind"], "overloaded");
}

#[tokio::test]
async fn client_disconnect_cancels_upstream() {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    let backend = ScriptedBackend {
        live: Mutex::new(Some(rx)),
        ..Default::default()
    };
    let (_backend, base) = spawn_test_server(backend).await;

    tx.unbounded_send(Ok(Chunk::text("first"))).unwrap();
    let resp = post_json(
        format!("{base}/api/stream"),
        serde_json::json!({ "message": "Hi" }),
    )
    .await;
    let mut body = resp.bytes_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("first"));
    drop(body);

    // Keep the upstream producing until the relay drops it.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if tx.unbounded_send(Ok(Chunk::text("more"))).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(closed.is_ok(), "upstream was not dropped after disconnect");
}
