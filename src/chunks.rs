//! Normalized stream chunks.
//!
//! Every backend speaks its own dialect: the CLI emits one JSON object per line
//! in several historical layouts, OpenAI-compatible providers emit SSE deltas.
//! Both are converted into [`ResponseChunk`] here, at the stream boundary, so
//! nothing downstream needs to sniff formats.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Backend stopped because it ran out of turns. Counts as complete.
    MaxTurns,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    NoCompletionMarker,
    NoOutput,
    TimeoutIncomplete,
    IncompleteAfterCrash,
    ErrorDuringExecution,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnostic {
    pub subtype: DiagnosticKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_required: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks_received: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseChunk {
    Content {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    Completion {
        finish_reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
        /// Error text carried by a failed result, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Metadata {
        data: Value,
    },
    Error(Diagnostic),
    /// Backend bookkeeping (init, tool results, unrecognized lines). Never
    /// forwarded to the caller.
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        data: Value,
    },
}

impl ResponseChunk {
    pub fn text(text: impl Into<String>) -> Self {
        ResponseChunk::Content { text: text.into() }
    }

    pub fn stop() -> Self {
        ResponseChunk::Completion {
            finish_reason: FinishReason::Stop,
            subtype: Some("success".to_string()),
            usage: None,
            detail: None,
        }
    }

    pub fn system(subtype: &str, data: Value) -> Self {
        ResponseChunk::System {
            subtype: Some(subtype.to_string()),
            data,
        }
    }

    pub fn is_forwardable(&self) -> bool {
        !matches!(self, ResponseChunk::System { .. })
    }

    /// True for a terminal chunk that marks the response as finished, either
    /// normally or by the turn limit.
    pub fn is_completion_marker(&self) -> bool {
        matches!(
            self,
            ResponseChunk::Completion {
                finish_reason: FinishReason::Stop | FinishReason::MaxTurns,
                ..
            }
        )
    }

    /// Text that the rate-limit gate must inspect.
    pub fn scan_text(&self) -> Option<&str> {
        match self {
            ResponseChunk::Content { text } => Some(text),
            ResponseChunk::Completion {
                detail: Some(detail),
                ..
            } => Some(detail),
            _ => None,
        }
    }

    /// Error text of a failed result chunk.
    pub fn error_detail(&self) -> Option<&str> {
        match self {
            ResponseChunk::Completion {
                detail: Some(detail),
                ..
            } => Some(detail),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResponseChunk::Content { .. } => "content",
            ResponseChunk::ToolUse { .. } => "tool_use",
            ResponseChunk::Completion { .. } => "completion",
            ResponseChunk::Metadata { .. } => "metadata",
            ResponseChunk::Error(_) => "error",
            ResponseChunk::System { .. } => "system",
        }
    }
}

impl Diagnostic {
    pub fn new(subtype: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            subtype,
            message: message.into(),
            action_required: None,
            chunks_received: None,
            original_error: None,
        }
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.action_required = Some(action.to_string());
        self
    }

    pub fn with_chunks_received(mut self, n: usize) -> Self {
        self.chunks_received = Some(n);
        self
    }

    pub fn with_original_error(mut self, err: impl Into<String>) -> Self {
        self.original_error = Some(err.into());
        self
    }
}

impl From<Diagnostic> for ResponseChunk {
    fn from(d: Diagnostic) -> Self {
        ResponseChunk::Error(d)
    }
}

/// Normalizes one line of CLI `stream-json` output.
pub fn normalize_cli_line(line: &str) -> Vec<ResponseChunk> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => normalize_cli_value(value),
        Err(_) => {
            tracing::debug!(
                "[STREAM] Non-JSON backend line: {}",
                crate::str_utils::prefix_chars(trimmed, 200)
            );
            vec![ResponseChunk::system(
                "unparsed",
                Value::String(trimmed.to_string()),
            )]
        }
    }
}

pub fn normalize_cli_value(value: Value) -> Vec<ResponseChunk> {
    let msg_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match msg_type {
        "system" => {
            let subtype = value
                .get("subtype")
                .and_then(|s| s.as_str())
                .map(str::to_string);
            vec![ResponseChunk::System {
                subtype,
                data: value,
            }]
        }
        "user" => vec![ResponseChunk::system("tool_result", value)],
        "result" => vec![normalize_result(&value)],
        "assistant" => {
            // Nested layout: {"type":"assistant","message":{"content":...}}
            let content = value
                .get("message")
                .and_then(|m| m.get("content"))
                .or_else(|| value.get("content"));
            blocks_or_system(content, &value)
        }
        _ if value.get("content").is_some() => {
            // Flat layout: {"content":[...]} without a type tag.
            blocks_or_system(value.get("content"), &value)
        }
        _ => {
            tracing::debug!("[STREAM] Unrecognized chunk type '{}'", msg_type);
            vec![ResponseChunk::system("unrecognized", value)]
        }
    }
}

fn normalize_result(value: &Value) -> ResponseChunk {
    let subtype = value.get("subtype").and_then(|s| s.as_str());
    let finish_reason = match subtype {
        Some("success") | Some("complete") => FinishReason::Stop,
        Some("error_max_turns") => FinishReason::MaxTurns,
        _ => FinishReason::Unknown,
    };
    let is_error = value
        .get("is_error")
        .and_then(|e| e.as_bool())
        .unwrap_or(false);
    let detail = if is_error {
        value
            .get("result")
            .or_else(|| value.get("error"))
            .and_then(|r| r.as_str())
            .map(str::to_string)
    } else {
        None
    };
    ResponseChunk::Completion {
        finish_reason,
        subtype: subtype.map(str::to_string),
        usage: value.get("usage").cloned(),
        detail,
    }
}

fn blocks_or_system(content: Option<&Value>, raw: &Value) -> Vec<ResponseChunk> {
    let chunks = match content {
        Some(Value::String(s)) if !s.is_empty() => vec![ResponseChunk::text(s.clone())],
        Some(Value::Array(blocks)) => blocks.iter().filter_map(normalize_block).collect(),
        _ => Vec::new(),
    };
    if chunks.is_empty() {
        return vec![ResponseChunk::system("empty_assistant", raw.clone())];
    }
    chunks
}

fn normalize_block(block: &Value) -> Option<ResponseChunk> {
    if let Some(s) = block.as_str() {
        return Some(ResponseChunk::text(s));
    }
    match block.get("type").and_then(|t| t.as_str()) {
        Some("text") => block
            .get("text")
            .and_then(|t| t.as_str())
            .map(ResponseChunk::text),
        Some("tool_use") => Some(ResponseChunk::ToolUse {
            id: str_field(block, "id"),
            name: str_field(block, "name"),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        // thinking, tool_result and friends stay internal
        _ => None,
    }
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string()
}

/// One decoded SSE line from an OpenAI-compatible provider.
#[derive(Debug)]
pub enum SseLine {
    Chunks(Vec<ResponseChunk>),
    Done,
    Error(String),
    Skip,
}

pub fn normalize_openai_line(line: &str) -> SseLine {
    let data = match line.trim().strip_prefix("data:") {
        Some(d) => d.trim(),
        None => return SseLine::Skip,
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("[STREAM] Undecodable SSE payload: {}", e);
            return SseLine::Skip;
        }
    };
    if let Some(err) = value.get("error") {
        let msg = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return SseLine::Error(msg);
    }

    let mut chunks = Vec::new();
    let choice = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    if let Some(choice) = choice {
        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                if !text.is_empty() {
                    chunks.push(ResponseChunk::text(text));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for call in calls {
                    let function = call.get("function");
                    chunks.push(ResponseChunk::ToolUse {
                        id: str_field(call, "id"),
                        name: function.map(|f| str_field(f, "name")).unwrap_or_default(),
                        input: function
                            .and_then(|f| f.get("arguments"))
                            .cloned()
                            .unwrap_or(Value::Null),
                    });
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            let finish_reason = match reason {
                "stop" | "tool_calls" => FinishReason::Stop,
                "length" => FinishReason::MaxTurns,
                _ => FinishReason::Unknown,
            };
            chunks.push(ResponseChunk::Completion {
                finish_reason,
                subtype: Some(reason.to_string()),
                usage: value.get("usage").cloned(),
                detail: None,
            });
        }
    }

    if chunks.is_empty() {
        chunks.push(ResponseChunk::system("delta", value));
    }
    SseLine::Chunks(chunks)
}
