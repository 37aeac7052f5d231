use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use std::path::Path;
use tracing::{error, info, info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;
use uuid::Uuid;

use crate::constants::{LOG_FILE_PREFIX, REQUEST_ID_HEADER};
use crate::redaction::RedactingWriter;

const DEFAULT_FILTER: &str = "switchyard=info,tower_http=warn";

/// Creates `log_dir`, warning on stderr when it cannot. The subscriber is not
/// installed yet at this point.
fn ensure_log_dir(log_dir: &Path) -> bool {
    match std::fs::create_dir_all(log_dir) {
        Ok(()) => true,
        Err(e) => {
            eprintln!(
                "Warning: could not create log directory {:?}: {}. File logging may be lost.",
                log_dir, e
            );
            false
        }
    }
}

/// Installs the global subscriber: human-readable stdout, a daily-rotated
/// redacted file under `log_dir`, and span-trace capture for errors.
///
/// The returned guard must be held for the life of the process or buffered
/// file lines are lost.
pub fn init_tracing(log_dir: &Path, json_file: bool) -> WorkerGuard {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };

    ensure_log_dir(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let make_writer = move || RedactingWriter::new(non_blocking.clone());

    let file_layer = if json_file {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(make_writer)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(make_writer)
            .with_ansi(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Reuses the caller's request id when it sent one, otherwise mints one, and
/// echoes it on the response.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(val) = &header {
        req.headers_mut().insert(REQUEST_ID_HEADER, val.clone());
    }

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;
    if let Some(val) = header {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

pub fn log_request_summary(provider: &str, model: Option<&str>, prompt_chars: usize, stream: bool) {
    info!(
        target: "flight_recorder",
        "[REQ] Provider: {} | Model: {} | Prompt: {} chars | Stream: {}",
        provider,
        model.unwrap_or("default"),
        prompt_chars,
        stream
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let res = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.headers()[REQUEST_ID_HEADER], "abc-123");
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let res = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = res.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_log_dir_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("taken");
        std::fs::write(&blocker, b"file, not a dir").unwrap();

        assert!(!ensure_log_dir(&blocker.join("logs")));
        assert!(ensure_log_dir(&dir.path().join("logs")));
        assert!(dir.path().join("logs").is_dir());
    }
}
