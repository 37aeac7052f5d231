//! Single-provider request lifecycle.
//!
//! One call to [`RequestExecutor::execute`] registers an invocation, starts the
//! backend, and pumps its chunks to the caller until the stream completes, the
//! deadline passes, the backend crashes or the invocation is cancelled. Every
//! emitted chunk is mirrored into the crash-recovery cache first.
//!
//! The central rule is commitment: once the first chunk has been forwarded the
//! request can no longer fail over, so every later problem is reported inline
//! as a diagnostic chunk instead of an error the orchestrator could act on.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::Instrument;

use crate::backend::{Backend, BackendConfig, ChunkStream, ExecuteOptions};
use crate::chunks::{Diagnostic, DiagnosticKind, FinishReason, ResponseChunk};
use crate::constants::{
    ACTION_INCREASE_TIMEOUT, ACTION_RETRY_FULL_REQUEST, ACTION_VERIFY_COMPLETENESS,
    WORKER_UNAVAILABLE_SIGNATURES,
};
use crate::disconnect::{StreamSignal, StreamSignalReceiver};
use crate::fallback::is_retryable;
use crate::metrics::{Outcome, OutcomeMetrics};
use crate::rate_limit::{self, RateLimitTracker};
use crate::recovery_cache::{CacheHandle, CrashRecoveryCache};
use crate::registry::{Invocation, InvocationRegistry};
use crate::str_utils::{find_phrase, prefix_chars};
use crate::summary::{RunSummary, RunTally, SummaryStore};
use crate::types::{InvocationId, InvocationStatus, ObservedError, RelayError, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2400);

/// Where forwarded chunks go. Cloned into every fallback attempt of a request;
/// the monitor signal closes once the last clone is dropped.
#[derive(Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<ResponseChunk>,
    signal: Arc<watch::Sender<StreamSignal>>,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<ResponseChunk>) -> (Self, StreamSignalReceiver) {
        let (signal, rx) = watch::channel(StreamSignal::default());
        (
            Self {
                tx,
                signal: Arc::new(signal),
            },
            rx,
        )
    }

    /// False once the receiving side is gone.
    async fn send(&self, chunk: ResponseChunk) -> bool {
        self.tx.send(chunk).await.is_ok()
    }

    fn announce(&self, id: &InvocationId) {
        self.signal.send_modify(|s| s.invocation = Some(id.clone()));
    }

    fn mark_streaming(&self) {
        self.signal.send_if_modified(|s| {
            let changed = !s.streaming;
            s.streaming = true;
            changed
        });
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionReport {
    pub invocation_id: InvocationId,
    pub provider_id: String,
    pub status: InvocationStatus,
    pub outcome: Outcome,
    pub chunks_forwarded: usize,
    pub response_complete: bool,
}

struct Run {
    invocation: Invocation,
    cache: CacheHandle,
    committed: bool,
    chunks_received: usize,
    chunks_forwarded: usize,
    response_complete: bool,
    tally: RunTally,
    started_at: std::time::Instant,
}

pub struct RequestExecutor {
    backend: Arc<dyn Backend>,
    registry: Arc<InvocationRegistry>,
    rate_limits: Arc<RateLimitTracker>,
    cache: CrashRecoveryCache,
    summaries: Arc<dyn SummaryStore>,
    metrics: Arc<OutcomeMetrics>,
    worker_id: String,
    timeout: Duration,
}

impl RequestExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<InvocationRegistry>,
        rate_limits: Arc<RateLimitTracker>,
        cache: CrashRecoveryCache,
        summaries: Arc<dyn SummaryStore>,
        metrics: Arc<OutcomeMetrics>,
        worker_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            rate_limits,
            cache,
            summaries,
            metrics,
            worker_id: worker_id.into(),
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<InvocationRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs one prompt against one provider.
    ///
    /// Returns `WorkerUnavailable` only while nothing has reached the caller;
    /// that is the single error the fallback chain may retry. Every other
    /// failure has already been reported to the caller as a diagnostic chunk.
    pub async fn execute(
        &self,
        prompt: &str,
        config: &BackendConfig,
        options: &ExecuteOptions,
        sink: &ChunkSink,
    ) -> Result<ExecutionReport> {
        let invocation = self.registry.create(prompt, &config.resolved_model_id);
        let span = tracing::info_span!(
            "invocation",
            id = %invocation.id.short(),
            provider = %config.provider_id
        );

        async move {
            tracing::info!(model = %config.resolved_model_id, "Invocation started");
            sink.announce(&invocation.id);

            let cache = self.cache.open(&invocation.id);
            let mut run = Run {
                invocation,
                cache,
                committed: false,
                chunks_received: 0,
                chunks_forwarded: 0,
                response_complete: false,
                tally: RunTally::new(),
                started_at: std::time::Instant::now(),
            };

            let result = self.drive(&mut run, prompt, config, options, sink).await;
            self.finish(run, config, result).await
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        run: &mut Run,
        prompt: &str,
        config: &BackendConfig,
        options: &ExecuteOptions,
        sink: &ChunkSink,
    ) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let token = run.invocation.cancellation.clone();

        let started = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(cancelled(run)),
            started = tokio::time::timeout_at(deadline, self.backend.start(prompt, config, options)) => started,
        };
        let mut stream: ChunkStream = match started {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.on_crash(run, e, sink).await,
            Err(_) => return self.on_timeout(run, sink).await,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = tokio::time::timeout_at(deadline, stream.next()) => Some(next),
            };

            match next {
                None => return Err(cancelled(run)),
                Some(Err(_)) => {
                    drop(stream);
                    return self.on_timeout(run, sink).await;
                }
                Some(Ok(None)) => break,
                Some(Ok(Some(Err(e)))) => {
                    drop(stream);
                    return self.on_crash(run, e, sink).await;
                }
                Some(Ok(Some(Ok(chunk)))) => {
                    run.chunks_received += 1;
                    self.process_chunk(run, chunk, sink).await?;
                }
            }
        }

        self.on_stream_end(run, sink).await
    }

    async fn process_chunk(&self, run: &mut Run, chunk: ResponseChunk, sink: &ChunkSink) -> Result<()> {
        self.cache.append(&mut run.cache, &chunk).await;

        if !chunk.is_forwardable() {
            tracing::trace!("Skipping {} chunk", chunk.kind());
            return Ok(());
        }

        // Once committed, answer text is the model's own words; only a failed
        // result's error detail can still report a usage limit.
        let scanned = if run.committed {
            chunk.error_detail()
        } else {
            chunk.scan_text()
        };
        let rate_limited =
            scanned.and_then(|text| rate_limit::detect(text).map(|phrase| (phrase, text.to_string())));
        if let Some((phrase, text)) = rate_limited {
            let reset = self.rate_limits.mark_rate_limited(&self.worker_id, &text);

            if !run.committed {
                let retry_after = self.rate_limits.retry_after_seconds(&self.worker_id);
                tracing::warn!(
                    "Rate limit detected before streaming ('{}'), resets at {}: {}",
                    phrase,
                    reset,
                    prefix_chars(&text, 200)
                );
                return Err(RelayError::WorkerUnavailable {
                    message: format!("rate limit detected: {}", prefix_chars(&text, 200)),
                    retry_after_secs: retry_after,
                }
                .into());
            }

            tracing::warn!(
                "Rate limit detected after {} chunks were streamed ('{}'), reporting inline",
                run.chunks_forwarded,
                phrase
            );
            run.tally.record_chunk(&chunk);
            self.forward(run, chunk, sink).await?;
            let diagnostic = Diagnostic::new(
                DiagnosticKind::RateLimited,
                format!("Backend hit its usage limit mid-response; resets at {}", reset),
            )
            .with_chunks_received(run.chunks_received);
            return self.forward(run, diagnostic.into(), sink).await;
        }

        if chunk.is_completion_marker() {
            run.response_complete = true;
            if let ResponseChunk::Completion {
                finish_reason: FinishReason::MaxTurns,
                ..
            } = &chunk
            {
                tracing::warn!("Backend stopped at its turn limit");
            }
        }

        run.tally.record_chunk(&chunk);
        self.forward(run, chunk, sink).await
    }

    async fn forward(&self, run: &mut Run, chunk: ResponseChunk, sink: &ChunkSink) -> Result<()> {
        if !sink.send(chunk).await {
            tracing::info!("Caller stopped receiving after {} chunks", run.chunks_forwarded);
            return Err(RelayError::Cancelled("caller disconnected".to_string()).into());
        }
        run.chunks_forwarded += 1;
        if !run.committed {
            run.committed = true;
            sink.mark_streaming();
            tracing::debug!(
                "First chunk forwarded after {:.2}s, request committed",
                run.started_at.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    /// Forwarding on a failure path: the failure outranks a vanished caller.
    async fn report(&self, run: &mut Run, chunk: ResponseChunk, sink: &ChunkSink) -> bool {
        self.forward(run, chunk, sink).await.is_ok()
    }

    async fn on_stream_end(&self, run: &mut Run, sink: &ChunkSink) -> Result<()> {
        if run.chunks_forwarded == 0 {
            tracing::error!(
                "Backend produced no output ({} chunks received, none forwardable)",
                run.chunks_received
            );
            let diagnostic = Diagnostic::new(
                DiagnosticKind::NoOutput,
                "Backend finished without producing any output. Check the provider configuration and credentials.",
            )
            .with_action(ACTION_RETRY_FULL_REQUEST)
            .with_chunks_received(run.chunks_received);
            self.forward(run, diagnostic.into(), sink).await?;
            return Err(RelayError::EmptyResponse(format!(
                "{} chunks received, none forwardable",
                run.chunks_received
            ))
            .into());
        }

        if !run.response_complete {
            tracing::warn!(
                "Stream ended without a completion marker after {} chunks",
                run.chunks_received
            );
            let diagnostic = Diagnostic::new(
                DiagnosticKind::NoCompletionMarker,
                "Response may be incomplete: the backend stream ended without a completion marker.",
            )
            .with_action(ACTION_VERIFY_COMPLETENESS)
            .with_chunks_received(run.chunks_received);
            self.forward(run, diagnostic.into(), sink).await?;
        }
        Ok(())
    }

    async fn on_timeout(&self, run: &mut Run, sink: &ChunkSink) -> Result<()> {
        tracing::warn!(
            "Backend timed out after {:?} ({} chunks received)",
            self.timeout,
            run.chunks_received
        );
        self.cache.delete(&mut run.cache).await;

        let diagnostic = Diagnostic::new(
            DiagnosticKind::TimeoutIncomplete,
            format!(
                "Backend timed out after {}s ({:.1} minutes). The response is incomplete.",
                self.timeout.as_secs(),
                self.timeout.as_secs_f64() / 60.0
            ),
        )
        .with_action(ACTION_INCREASE_TIMEOUT)
        .with_chunks_received(run.chunks_received);
        self.report(run, diagnostic.into(), sink).await;

        Err(RelayError::Timeout(self.timeout).into())
    }

    async fn on_crash(&self, run: &mut Run, err: ObservedError, sink: &ChunkSink) -> Result<()> {
        let message = err.inner.to_string();

        if !run.committed {
            let signature = find_phrase(&message, WORKER_UNAVAILABLE_SIGNATURES);
            if signature.is_some() || is_retryable(&err) {
                tracing::warn!(
                    "Backend failed before streaming ({}): {}",
                    signature.unwrap_or("retryable"),
                    message
                );
                return Err(RelayError::WorkerUnavailable {
                    message,
                    retry_after_secs: None,
                }
                .into());
            }
        }

        tracing::error!(
            "Backend crashed after {} chunks: {}",
            run.chunks_received,
            message
        );

        let replay = self.cache.replay(&run.cache).await;
        let recovered: Vec<ResponseChunk> = replay
            .chunks
            .into_iter()
            .filter(ResponseChunk::is_forwardable)
            .collect();

        if recovered.is_empty() {
            let diagnostic = Diagnostic::new(
                DiagnosticKind::ErrorDuringExecution,
                format!("Backend failed before producing output: {}", message),
            )
            .with_action(ACTION_RETRY_FULL_REQUEST)
            .with_chunks_received(run.chunks_received)
            .with_original_error(message.clone());
            self.report(run, diagnostic.into(), sink).await;
            return Err(RelayError::BackendCrashed {
                message,
                recovered_chunks: 0,
            }
            .into());
        }

        let count = recovered.len();
        let complete = recovered.iter().any(ResponseChunk::is_completion_marker);
        tracing::info!(
            "Replaying {} recovered chunks ({} corrupt lines skipped)",
            count,
            replay.corrupt_lines
        );

        let marker = ResponseChunk::Metadata {
            data: serde_json::json!({
                "recovery": "replay_start",
                "chunks": count,
                "corrupt_lines": replay.corrupt_lines,
            }),
        };
        let mut delivered = self.report(run, marker, sink).await;
        for chunk in recovered {
            if !delivered {
                break;
            }
            delivered = self.report(run, chunk, sink).await;
        }

        if complete {
            run.response_complete = true;
        } else if delivered {
            let diagnostic = Diagnostic::new(
                DiagnosticKind::IncompleteAfterCrash,
                format!(
                    "Response incomplete: backend crashed after {} chunks.",
                    run.chunks_received
                ),
            )
            .with_action(ACTION_RETRY_FULL_REQUEST)
            .with_chunks_received(run.chunks_received)
            .with_original_error(message.clone());
            self.report(run, diagnostic.into(), sink).await;
        }

        Err(RelayError::BackendCrashed {
            message,
            recovered_chunks: count,
        }
        .into())
    }

    async fn finish(
        &self,
        mut run: Run,
        config: &BackendConfig,
        result: Result<()>,
    ) -> Result<ExecutionReport> {
        let status = match &result {
            Ok(()) => InvocationStatus::Completed,
            Err(e) if matches!(e.inner, RelayError::Cancelled(_)) => InvocationStatus::Cancelled,
            Err(_) => InvocationStatus::Failed,
        };
        let outcome = classify(&result, run.response_complete);
        let id = run.invocation.id.clone();

        self.registry.complete(&id, status);
        self.cache.delete(&mut run.cache).await;
        run.tally.log_summary(&id, status);

        let summary = RunSummary {
            invocation_id: id.clone(),
            provider_id: config.provider_id.clone(),
            model: config.resolved_model_id.clone(),
            status,
            completed_at: chrono::Utc::now(),
            duration_seconds: run.started_at.elapsed().as_secs_f64(),
            chunks_forwarded: run.chunks_forwarded,
            text_chars: run.tally.text.chars().count(),
            word_count: run.tally.word_count(),
            tools_used: run.tally.tool_names.iter().cloned().collect(),
            response_complete: run.response_complete,
        };
        if let Err(e) = self.summaries.write(&summary).await {
            tracing::warn!("Failed to write final summary: {}", e);
        }

        self.metrics
            .record(&config.provider_id, outcome, run.chunks_forwarded)
            .await;

        tracing::info!(
            status = %status,
            ?outcome,
            chunks = run.chunks_forwarded,
            "Invocation finished"
        );

        result.map(|()| ExecutionReport {
            invocation_id: id,
            provider_id: config.provider_id.clone(),
            status,
            outcome,
            chunks_forwarded: run.chunks_forwarded,
            response_complete: run.response_complete,
        })
    }
}

fn cancelled(run: &Run) -> ObservedError {
    tracing::info!(
        "Invocation cancelled after {} chunks",
        run.chunks_forwarded
    );
    RelayError::Cancelled(format!("invocation {} cancelled", run.invocation.id)).into()
}

fn classify(result: &Result<()>, response_complete: bool) -> Outcome {
    match result {
        Ok(()) if response_complete => Outcome::Completed,
        Ok(()) => Outcome::Incomplete,
        Err(e) => match &e.inner {
            RelayError::WorkerUnavailable {
                retry_after_secs: Some(_),
                ..
            } => Outcome::RateLimited,
            RelayError::WorkerUnavailable { .. } => Outcome::WorkerUnavailable,
            RelayError::Timeout(_) => Outcome::TimedOut,
            RelayError::BackendCrashed {
                recovered_chunks, ..
            } if *recovered_chunks > 0 => Outcome::CrashRecovered,
            RelayError::BackendCrashed { .. } => Outcome::CrashUnrecovered,
            RelayError::EmptyResponse(_) => Outcome::EmptyResponse,
            RelayError::Cancelled(_) => Outcome::Cancelled,
            _ => Outcome::Failed,
        },
    }
}
