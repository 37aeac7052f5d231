#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use switchyard::backend::{Backend, BackendConfig, ChunkStream, ConnectionParams, ExecuteOptions};
use switchyard::chunks::ResponseChunk;
use switchyard::executor::{ChunkSink, ExecutionReport, RequestExecutor};
use switchyard::metrics::OutcomeMetrics;
use switchyard::rate_limit::RateLimitTracker;
use switchyard::recovery_cache::CrashRecoveryCache;
use switchyard::registry::InvocationRegistry;
use switchyard::summary::{RunSummary, SummaryStore};
use switchyard::types::{RelayError, Result};

pub const WORKER: &str = "worker-test";

/// One scripted backend action.
#[derive(Clone, Debug)]
pub enum Step {
    Chunk(ResponseChunk),
    /// Stream yields an error (the process died).
    Fail(String),
    /// `start` itself fails with a backend error.
    FailStart(String),
    /// `start` itself fails with an upstream HTTP status.
    FailStatus(u16),
    Delay(Duration),
    /// Never yields again.
    Hang,
}

/// In-memory backend replaying a fixed script per provider.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, provider: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(provider.to_string(), steps);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn start(
        &self,
        _prompt: &str,
        config: &BackendConfig,
        _options: &ExecuteOptions,
    ) -> Result<ChunkStream> {
        self.calls.lock().unwrap().push(config.provider_id.clone());
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .get(&config.provider_id)
            .cloned()
            .unwrap_or_default();

        match steps.first() {
            Some(Step::FailStart(message)) => {
                return Err(RelayError::Backend(message.clone()).into());
            }
            Some(Step::FailStatus(code)) => {
                let status = StatusCode::from_u16(*code).unwrap();
                return Err(RelayError::Upstream(status, format!("upstream said {}", code)).into());
            }
            _ => {}
        }

        let stream = stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    Step::Chunk(chunk) => return Some((Ok(chunk), steps)),
                    Step::Fail(message) => {
                        return Some((Err(RelayError::Backend(message).into()), steps))
                    }
                    Step::Delay(d) => tokio::time::sleep(d).await,
                    Step::Hang => std::future::pending::<()>().await,
                    Step::FailStart(_) | Step::FailStatus(_) => {}
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Records summaries in memory, or fails every write.
#[derive(Default)]
pub struct MemorySummaryStore {
    pub written: Mutex<Vec<RunSummary>>,
    pub fail: bool,
}

#[async_trait]
impl SummaryStore for MemorySummaryStore {
    async fn write(&self, summary: &RunSummary) -> std::io::Result<()> {
        if self.fail {
            return Err(std::io::Error::other("disk full"));
        }
        self.written.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

pub fn cli_config(provider: &str) -> BackendConfig {
    BackendConfig {
        provider_id: provider.to_string(),
        connection: ConnectionParams::Cli {
            program: "scripted".into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        },
        resolved_model_id: "sonnet".into(),
        privacy_enabled: false,
    }
}

pub fn text(s: &str) -> Step {
    Step::Chunk(ResponseChunk::text(s))
}

pub fn stop() -> Step {
    Step::Chunk(ResponseChunk::stop())
}

pub fn system() -> Step {
    Step::Chunk(ResponseChunk::system("init", serde_json::json!({})))
}

pub struct Harness {
    pub backend: Arc<ScriptedBackend>,
    pub executor: Arc<RequestExecutor>,
    pub registry: Arc<InvocationRegistry>,
    pub rate_limits: Arc<RateLimitTracker>,
    pub metrics: Arc<OutcomeMetrics>,
    pub summaries: Arc<MemorySummaryStore>,
    pub cache_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(timeout: Duration) -> Self {
        Self::with_cache_budget(timeout, 10 * 1024 * 1024)
    }

    pub fn with_cache_budget(timeout: Duration, budget: u64) -> Self {
        Self::build(timeout, budget, Arc::new(MemorySummaryStore::default()))
    }

    pub fn build(timeout: Duration, budget: u64, summaries: Arc<MemorySummaryStore>) -> Self {
        let backend = ScriptedBackend::new();
        let registry = Arc::new(InvocationRegistry::new());
        let rate_limits = Arc::new(RateLimitTracker::new());
        let metrics = Arc::new(OutcomeMetrics::new());
        let cache_dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(RequestExecutor::new(
            backend.clone(),
            registry.clone(),
            rate_limits.clone(),
            CrashRecoveryCache::new(cache_dir.path(), budget),
            summaries.clone(),
            metrics.clone(),
            WORKER,
            timeout,
        ));
        Self {
            backend,
            executor,
            registry,
            rate_limits,
            metrics,
            summaries,
            cache_dir,
        }
    }

    /// Runs one invocation and collects everything the caller received.
    pub async fn run(&self, provider: &str) -> (Result<ExecutionReport>, Vec<ResponseChunk>) {
        let (tx, rx) = mpsc::channel(16);
        let (sink, _signal) = ChunkSink::new(tx);
        let collector = tokio::spawn(collect(rx));

        let result = self
            .executor
            .execute("prompt", &cli_config(provider), &ExecuteOptions::default(), &sink)
            .await;
        drop(sink);
        (result, collector.await.unwrap())
    }

    pub fn cache_files(&self) -> usize {
        std::fs::read_dir(self.cache_dir.path()).unwrap().count()
    }
}

pub async fn collect(mut rx: mpsc::Receiver<ResponseChunk>) -> Vec<ResponseChunk> {
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.push(chunk);
    }
    out
}
