use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationId(pub String);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InvocationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InvocationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a tracked invocation. Transitions only go from `Running` to
/// one of the terminal states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvocationStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvocationStatus::Running => "running",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Cancelled => "cancelled",
            InvocationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    /// The worker cannot serve this request right now. Raised only before the
    /// first chunk reaches the caller. `retry_after_secs` is set when the
    /// cause was a detected rate limit.
    #[error("Worker unavailable: {message}")]
    WorkerUnavailable {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend crashed: {message} (recovered {recovered_chunks} chunks)")]
    BackendCrashed {
        message: String,
        recovered_chunks: usize,
    },

    #[error("Backend produced no output: {0}")]
    EmptyResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invocation cancelled: {0}")]
    Cancelled(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl RelayError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            RelayError::WorkerUnavailable {
                retry_after_secs: Some(_),
                ..
            }
        )
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::{header, HeaderValue, StatusCode};

        if let RelayError::WorkerUnavailable {
            message,
            retry_after_secs,
        } = &self.inner
        {
            // The reverse proxy retries on another worker right away.
            let mut error = serde_json::json!({
                "message": message,
                "type": "service_unavailable",
                "code": "503",
                "retry": true,
            });
            if let Some(secs) = retry_after_secs {
                error["retry_after_seconds"] = serde_json::json!(secs);
            }
            let mut response = (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(serde_json::json!({ "error": error })),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from_static("0"));
            headers.insert(
                crate::constants::WORKER_FAILOVER_HEADER,
                HeaderValue::from_static("true"),
            );
            return response;
        }

        let (status, msg, code) = match &self.inner {
            RelayError::WorkerUnavailable { message, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                message.clone(),
                "WORKER_UNAVAILABLE",
            ),
            RelayError::Timeout(d) => (
                StatusCode::GATEWAY_TIMEOUT,
                format!("timed out after {}s", d.as_secs()),
                "TIMEOUT",
            ),
            RelayError::BackendCrashed { message, .. } => (
                StatusCode::BAD_GATEWAY,
                message.clone(),
                "BACKEND_CRASHED",
            ),
            RelayError::EmptyResponse(m) => (StatusCode::BAD_GATEWAY, m.clone(), "EMPTY_RESPONSE"),
            RelayError::Configuration(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "CONFIGURATION_ERROR",
            ),
            RelayError::Cancelled(m) => (
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                m.clone(),
                "CANCELLED",
            ),
            RelayError::Backend(m) => (StatusCode::BAD_GATEWAY, m.clone(), "BACKEND_ERROR"),
            RelayError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            RelayError::Network(e) => (StatusCode::BAD_GATEWAY, e.to_string(), "NETWORK_ERROR"),
            RelayError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            RelayError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "IO_ERROR"),
            RelayError::InvalidRequest(m) => (StatusCode::BAD_REQUEST, m.clone(), "INVALID_REQUEST"),
            RelayError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND"),
            RelayError::Conflict(m) => (StatusCode::CONFLICT, m.clone(), "CONFLICT"),
            RelayError::Internal(m, _) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
                "span_trace": self.span_trace.to_string(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
