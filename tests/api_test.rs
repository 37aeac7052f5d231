mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use clap::Parser;
use common::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use switchyard::resolver::{BackendResolver, ProviderCatalog};
use switchyard::types::InvocationStatus;
use switchyard::{AppState, Args};

struct TestApp {
    state: Arc<AppState>,
    backend: Arc<ScriptedBackend>,
    _cache_dir: tempfile::TempDir,
}

impl TestApp {
    fn new() -> Self {
        let cache_dir = tempfile::tempdir().unwrap();
        let args = Args::parse_from([
            "switchyard",
            "--worker-id",
            WORKER,
            "--fallback-backoff-ms",
            "0",
            "--cache-dir",
            cache_dir.path().to_str().unwrap(),
        ]);

        let catalog: ProviderCatalog = serde_json::from_value(json!({
            "default_provider": "cli",
            "providers": [
                { "id": "cli", "kind": "cli", "model": "sonnet", "program": "scripted",
                  "fallbacks": ["backup"] },
                { "id": "backup", "kind": "cli", "model": "sonnet", "program": "scripted" },
                { "id": "solo", "kind": "cli", "model": "sonnet", "program": "scripted" }
            ]
        }))
        .unwrap();
        catalog.validate().unwrap();

        let backend = ScriptedBackend::new();
        let chains = catalog.fallback_chains();
        let resolver: Arc<dyn BackendResolver> = Arc::new(catalog);
        let state = Arc::new(AppState::build_with_summaries(
            args,
            backend.clone(),
            resolver,
            chains,
            Arc::new(MemorySummaryStore::default()),
        ));
        Self {
            state,
            backend,
            _cache_dir: cache_dir,
        }
    }

    fn router(&self) -> Router {
        switchyard::api::router(self.state.clone())
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn delete(&self, uri: &str) -> Response {
        self.send(
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn complete(&self, body: Value) -> Response {
        self.send(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn user(text: &str) -> Value {
    json!({ "messages": [{ "role": "user", "content": text }] })
}

#[tokio::test]
async fn test_non_streaming_completion() {
    let app = TestApp::new();
    app.backend
        .script("cli", vec![system(), text("Hello, "), text("world"), stop()]);

    let response = app.complete(user("hi")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello, world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body.get("x_diagnostics").is_none());
}

#[tokio::test]
async fn test_streaming_completion_ends_with_done() {
    let app = TestApp::new();
    app.backend
        .script("cli", vec![text("one"), text("two"), stop()]);

    let mut request = user("hi");
    request["stream"] = json!(true);
    let response = app.complete(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let text = body_text(response).await;
    let events: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();
    assert_eq!(events.len(), 4);
    assert_eq!(*events.last().unwrap(), "[DONE]");

    let first: Value = serde_json::from_str(events[0]).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(first["choices"][0]["delta"]["content"], "one");
    let second: Value = serde_json::from_str(events[1]).unwrap();
    assert!(second["choices"][0]["delta"].get("role").is_none());
    let finish: Value = serde_json::from_str(events[2]).unwrap();
    assert_eq!(finish["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_exhausted_chain_returns_503_for_failover() {
    let app = TestApp::new();
    app.backend.script("solo", vec![Step::FailStatus(503)]);

    let mut request = user("hi");
    request["provider"] = json!("solo");
    let response = app.complete(request).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "0");
    assert_eq!(response.headers()["x-worker-failover"], "true");
    let body = body_json(response).await;
    assert_eq!(body["error"]["retry"], true);
}

#[tokio::test]
async fn test_fallback_provider_serves_request() {
    let app = TestApp::new();
    app.backend.script("cli", vec![Step::FailStatus(502)]);
    app.backend
        .script("backup", vec![text("from backup"), stop()]);

    let response = app.complete(user("hi")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "from backup");
    assert_eq!(app.backend.calls(), vec!["cli", "backup"]);

    let health = body_json(app.get("/health").await).await;
    let providers = health["providers"].as_array().unwrap();
    let cli = providers.iter().find(|p| p["provider_id"] == "cli").unwrap();
    assert_eq!(cli["consecutive_failures"], 1);
    assert_eq!(cli["status"], "degraded");
}

#[tokio::test]
async fn test_rate_limit_before_output_marks_worker() {
    let app = TestApp::new();
    app.backend.script(
        "solo",
        vec![text("Claude usage limit reached. Your limit will reset at 3pm (UTC).")],
    );

    let mut request = user("hi");
    request["provider"] = json!("solo");
    let response = app.complete(request).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert!(body["error"]["retry_after_seconds"].as_u64().unwrap() >= 60);

    let limits = body_json(app.get("/v1/rate-limits").await).await;
    assert_eq!(limits["worker_id"], WORKER);
    assert_eq!(limits["rate_limited"], true);
    assert_eq!(limits["records"].as_array().unwrap().len(), 1);

    let health = body_json(app.get("/health").await).await;
    assert_eq!(health["status"], "rate_limited");
    assert_eq!(health["worker_instance"], WORKER);
}

#[tokio::test]
async fn test_diagnostics_reach_non_streaming_caller() {
    let app = TestApp::new();
    app.backend.script("cli", vec![text("partial answer")]);

    let response = app.complete(user("hi")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.starts_with("partial answer"));
    assert!(content.contains("[no_completion_marker]"));
    assert_eq!(body["x_diagnostics"][0]["subtype"], "no_completion_marker");
    assert!(body["choices"][0]["finish_reason"].is_null());
}

#[tokio::test]
async fn test_invalid_messages_rejected() {
    let app = TestApp::new();

    let response = app
        .complete(json!({ "messages": [{ "role": "system", "content": "be brief" }] }))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.backend.calls().is_empty());
}

#[tokio::test]
async fn test_invocation_endpoints() {
    let app = TestApp::new();
    app.backend.script("cli", vec![text("done"), stop()]);
    assert_eq!(app.complete(user("hi")).await.status(), StatusCode::OK);

    let listed = body_json(app.get("/v1/invocations").await).await;
    assert_eq!(listed["count"], 1);
    let id = listed["invocations"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(
        listed["invocations"][0]["status"],
        serde_json::to_value(InvocationStatus::Completed).unwrap()
    );

    let one = app.get(&format!("/v1/invocations/{}", id)).await;
    assert_eq!(one.status(), StatusCode::OK);
    assert_eq!(body_json(one).await["id"], id.as_str());

    let stats = body_json(app.get("/v1/invocations/stats").await).await;
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["completed"], 1);

    let finished = app.delete(&format!("/v1/invocations/{}", id)).await;
    assert_eq!(finished.status(), StatusCode::CONFLICT);

    let missing = app.get("/v1/invocations/does-not-exist").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let missing = app.delete("/v1/invocations/does-not-exist").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let cleaned = body_json(app.delete("/v1/invocations?max_age_hours=0").await).await;
    assert_eq!(cleaned["removed"], 1);
    assert_eq!(cleaned["max_age_hours"], 0);
}

#[tokio::test]
async fn test_cancel_running_invocation_via_api() {
    let app = Arc::new(TestApp::new());
    app.backend.script(
        "cli",
        vec![Step::Delay(Duration::from_secs(30)), text("too late"), stop()],
    );

    let request = {
        let app = app.clone();
        tokio::spawn(async move { app.complete(user("slow")).await.status() })
    };

    let id = loop {
        if let Some(inv) = app
            .state
            .registry
            .list(Some(InvocationStatus::Running))
            .first()
        {
            break inv.id.clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let cancelled = app.delete(&format!("/v1/invocations/{}", id)).await;
    assert_eq!(cancelled.status(), StatusCode::OK);
    assert_eq!(body_json(cancelled).await["cancelled"], true);

    let status = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.as_u16(), 499);
    assert_eq!(
        app.state.registry.get(&id).unwrap().status,
        InvocationStatus::Cancelled
    );
}

#[tokio::test]
async fn test_metrics_and_liveness() {
    let app = TestApp::new();
    app.backend.script("cli", vec![text("ok"), stop()]);
    assert_eq!(app.complete(user("hi")).await.status(), StatusCode::OK);

    let live = body_json(app.get("/livez").await).await;
    assert_eq!(live["status"], "ok");

    let metrics = body_json(app.get("/v1/metrics").await).await;
    assert_eq!(metrics["worker_id"], WORKER);
    assert_eq!(metrics["providers"]["cli"]["completed"], 1);
    assert_eq!(metrics["providers"]["cli"]["chunks_forwarded"], 2);
}
