//! HTTP surface: the OpenAI-style completion endpoint plus invocation,
//! rate-limit and metrics introspection.

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{future, stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;
use tracing::Instrument;

use crate::backend::ExecuteOptions;
use crate::chunks::{Diagnostic, FinishReason, ResponseChunk};
use crate::disconnect::ConnectionLiveness;
use crate::executor::{ChunkSink, ExecutionReport};
use crate::health;
use crate::logging::{log_request_summary, request_id_middleware};
use crate::registry::{Invocation, RegistryStats};
use crate::resolver::PrivacyPreference;
use crate::types::{InvocationId, InvocationStatus, RelayError, Result};
use crate::AppState;

const CHUNK_CHANNEL_CAPACITY: usize = 64;

pub fn router(state: Arc<AppState>) -> Router {
    let max_body_size = state.args.max_body_size;
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .route(
            "/v1/invocations",
            get(list_invocations).delete(cleanup_invocations),
        )
        .route("/v1/invocations/stats", get(invocation_stats))
        .route(
            "/v1/invocations/:id",
            get(get_invocation).delete(cancel_invocation),
        )
        .route("/v1/rate-limits", get(rate_limits))
        .route("/v1/metrics", get(metrics))
        .route("/health", get(health::health))
        .route("/livez", get(health::liveness))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_size))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Either a plain string or a list of content parts.
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub privacy: PrivacyPreference,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.as_str()),
                _ => p.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flattens a chat transcript into the single prompt the CLI takes. System
/// messages become the system prompt; a lone user message is passed as-is.
pub fn messages_to_prompt(messages: &[ChatMessage]) -> Result<(String, Option<String>)> {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for m in messages {
        let text = content_text(&m.content);
        if text.trim().is_empty() {
            continue;
        }
        match m.role.as_str() {
            "system" | "developer" => system.push(text),
            role => turns.push((role.to_string(), text)),
        }
    }

    let prompt = match turns.as_slice() {
        [] => {
            return Err(
                RelayError::InvalidRequest("no user or assistant content in messages".into())
                    .into(),
            )
        }
        [(_, only)] => only.clone(),
        many => many
            .iter()
            .map(|(role, text)| {
                let label = if role == "assistant" { "Assistant" } else { "Human" };
                format!("{}: {}", label, text)
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    let system_prompt = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((prompt, system_prompt))
}

/// Renders normalized chunks as OpenAI `chat.completion.chunk` objects.
pub struct CompletionFormatter {
    id: String,
    created: i64,
    model: String,
    role_sent: bool,
}

impl CompletionFormatter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            role_sent: false,
        }
    }

    fn envelope(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    fn delta_text(&mut self, text: &str) -> Value {
        if self.role_sent {
            json!({ "content": text })
        } else {
            self.role_sent = true;
            json!({ "role": "assistant", "content": text })
        }
    }

    pub fn format(&mut self, chunk: &ResponseChunk) -> Option<Value> {
        match chunk {
            ResponseChunk::Content { text } => {
                let delta = self.delta_text(text);
                Some(self.envelope(delta, None))
            }
            ResponseChunk::ToolUse { id, name, input } => {
                let mut event = self.envelope(json!({}), None);
                event["x_tool_use"] = json!({ "id": id, "name": name, "input": input });
                Some(event)
            }
            ResponseChunk::Completion {
                finish_reason,
                usage,
                ..
            } => {
                let mut event = self.envelope(json!({}), Some(finish_reason_str(*finish_reason)));
                if let Some(usage) = usage {
                    event["usage"] = usage.clone();
                }
                Some(event)
            }
            ResponseChunk::Metadata { data } => {
                let mut event = self.envelope(json!({}), None);
                event["x_metadata"] = data.clone();
                Some(event)
            }
            ResponseChunk::Error(diagnostic) => {
                let delta = self.delta_text(&diagnostic_text(diagnostic));
                let mut event = self.envelope(delta, None);
                event["x_diagnostic"] = json!(diagnostic);
                Some(event)
            }
            ResponseChunk::System { .. } => None,
        }
    }
}

fn finish_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop | FinishReason::Unknown => "stop",
        FinishReason::MaxTurns => "length",
    }
}

fn diagnostic_text(diagnostic: &Diagnostic) -> String {
    let subtype = serde_json::to_value(diagnostic.subtype)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    format!("\n\n[{}] {}", subtype, diagnostic.message)
}

fn is_replay_start(chunk: &ResponseChunk) -> bool {
    matches!(
        chunk,
        ResponseChunk::Metadata { data } if data.get("recovery").and_then(Value::as_str) == Some("replay_start")
    )
}

/// Collects a whole stream into one `chat.completion` body.
#[derive(Default)]
pub struct CompletionAggregator {
    text: String,
    tool_uses: Vec<Value>,
    diagnostics: Vec<Diagnostic>,
    finish_reason: Option<FinishReason>,
    usage: Option<Value>,
}

impl CompletionAggregator {
    pub fn push(&mut self, chunk: ResponseChunk) {
        if is_replay_start(&chunk) {
            // Recovered chunks repeat what was already received.
            self.text.clear();
            self.tool_uses.clear();
            return;
        }
        match chunk {
            ResponseChunk::Content { text } => self.text.push_str(&text),
            ResponseChunk::ToolUse { id, name, input } => {
                self.tool_uses
                    .push(json!({ "id": id, "name": name, "input": input }))
            }
            ResponseChunk::Completion {
                finish_reason,
                usage,
                ..
            } => {
                self.finish_reason = Some(finish_reason);
                if usage.is_some() {
                    self.usage = usage;
                }
            }
            ResponseChunk::Error(diagnostic) => {
                self.text.push_str(&diagnostic_text(&diagnostic));
                self.diagnostics.push(diagnostic);
            }
            ResponseChunk::Metadata { .. } | ResponseChunk::System { .. } => {}
        }
    }

    pub fn finish(self, model: &str) -> Value {
        let mut body = json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": self.text },
                "finish_reason": self.finish_reason.map(finish_reason_str),
            }],
        });
        if let Some(usage) = self.usage {
            body["usage"] = usage;
        }
        if !self.tool_uses.is_empty() {
            body["x_tool_uses"] = Value::Array(self.tool_uses);
        }
        if !self.diagnostics.is_empty() {
            body["x_diagnostics"] = json!(self.diagnostics);
        }
        body
    }
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response> {
    let (prompt, system_prompt) = messages_to_prompt(&request.messages)?;
    let provider = request
        .provider
        .clone()
        .unwrap_or_else(|| state.default_provider());
    let model_label = request.model.clone().unwrap_or_else(|| provider.clone());
    log_request_summary(
        &provider,
        request.model.as_deref(),
        prompt.chars().count(),
        request.stream,
    );

    let options = ExecuteOptions {
        max_turns: request.max_turns,
        system_prompt,
        allowed_tools: request.allowed_tools,
        disallowed_tools: request.disallowed_tools,
    };

    let (tx, mut rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let (sink, signal) = ChunkSink::new(tx);
    let (liveness, guard) = ConnectionLiveness::new();
    tokio::spawn(
        state
            .monitor
            .watch(liveness, signal, state.registry.clone())
            .in_current_span(),
    );

    let task_state = state.clone();
    let model = request.model;
    let privacy = request.privacy;
    let task = tokio::spawn(
        async move {
            let executor = task_state.executor.clone();
            let resolver = task_state.resolver.clone();
            task_state
                .orchestrator
                .execute_with_fallback(
                    &provider,
                    |config, _provider_id| {
                        let executor = executor.clone();
                        let sink = sink.clone();
                        let prompt = prompt.clone();
                        let options = options.clone();
                        async move { executor.execute(&prompt, &config, &options, &sink).await }
                    },
                    |provider_id| resolver.resolve(provider_id, model.as_deref(), privacy),
                )
                .await
        }
        .in_current_span(),
    );

    // Every sink clone lives inside the task, so the channel closes with no
    // chunk exactly when the whole chain failed before committing.
    let first = match rx.recv().await {
        Some(chunk) => chunk,
        None => {
            return match task.await {
                Ok(Ok(report)) => Err(RelayError::EmptyResponse(format!(
                    "invocation {} finished without output",
                    report.invocation_id
                ))
                .into()),
                Ok(Err(e)) => {
                    tracing::warn!("Request failed before streaming: {}", e.inner);
                    Err(e)
                }
                Err(e) => Err(RelayError::Internal(
                    format!("request task failed: {}", e),
                    tracing_error::SpanTrace::capture(),
                )
                .into()),
            };
        }
    };

    if request.stream {
        let mut formatter = CompletionFormatter::new(model_label);
        let events = stream::once(future::ready(first))
            .chain(ReceiverStream::new(rx))
            .filter_map(move |chunk| future::ready(formatter.format(&chunk)))
            .map(move |payload| {
                // Dropped with the response body, which marks the caller gone.
                let _held: &DropGuard = &guard;
                Event::default().json_data(payload)
            })
            .chain(stream::once(future::ready(Ok::<_, axum::Error>(
                Event::default().data("[DONE]"),
            ))));

        return Ok(Sse::new(events)
            .keep_alive(
                KeepAlive::new()
                    .interval(Duration::from_secs(15))
                    .text(": keepalive"),
            )
            .into_response());
    }

    let mut aggregator = CompletionAggregator::default();
    aggregator.push(first);
    while let Some(chunk) = rx.recv().await {
        aggregator.push(chunk);
    }
    log_report(task.await);
    drop(guard);

    Ok(Json(aggregator.finish(&model_label)).into_response())
}

fn log_report(joined: std::result::Result<Result<ExecutionReport>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(report)) => tracing::debug!(
            invocation = %report.invocation_id.short(),
            provider = %report.provider_id,
            "Request finished: {:?}",
            report.outcome
        ),
        Ok(Err(e)) => tracing::debug!("Request finished after streaming: {}", e.inner),
        Err(e) => tracing::error!("Request task failed: {}", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<InvocationStatus>,
}

pub async fn list_invocations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let invocations = state.registry.list(query.status);
    Json(json!({
        "count": invocations.len(),
        "invocations": invocations,
    }))
}

pub async fn invocation_stats(State(state): State<Arc<AppState>>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

pub async fn get_invocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Invocation>> {
    state
        .registry
        .get(&InvocationId::from(id.as_str()))
        .map(Json)
        .ok_or_else(|| RelayError::NotFound(format!("invocation {}", id)).into())
}

pub async fn cancel_invocation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let id = InvocationId::from(id);
    let invocation = state
        .registry
        .get(&id)
        .ok_or_else(|| RelayError::NotFound(format!("invocation {}", id)))?;

    if invocation.status != InvocationStatus::Running || !state.registry.cancel(&id) {
        return Err(RelayError::Conflict(format!(
            "invocation {} is {}",
            id, invocation.status
        ))
        .into());
    }

    tracing::info!(invocation = %id.short(), "Invocation cancelled via API");
    Ok(Json(json!({ "invocation_id": id, "cancelled": true })))
}

fn default_max_age_hours() -> i64 {
    24
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,
}

pub async fn cleanup_invocations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> Json<Value> {
    let removed = state
        .registry
        .cleanup(chrono::Duration::hours(query.max_age_hours));
    Json(json!({ "removed": removed, "max_age_hours": query.max_age_hours }))
}

pub async fn rate_limits(State(state): State<Arc<AppState>>) -> Json<Value> {
    let worker = state.worker_id.as_str();
    Json(json!({
        "worker_id": worker,
        "rate_limited": state.rate_limits.is_rate_limited(worker),
        "retry_after_seconds": state.rate_limits.retry_after_seconds(worker),
        "records": state.rate_limits.snapshot(),
    }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "worker_id": state.worker_id,
        "providers": state.metrics.get_all_metrics().await,
    }))
}
