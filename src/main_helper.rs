use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::constants::DEFAULT_CACHE_BUDGET_BYTES;
use crate::disconnect::DisconnectMonitor;
use crate::executor::RequestExecutor;
use crate::fallback::FallbackOrchestrator;
use crate::health::ProviderHealthTracker;
use crate::metrics::OutcomeMetrics;
use crate::rate_limit::RateLimitTracker;
use crate::recovery_cache::CrashRecoveryCache;
use crate::registry::InvocationRegistry;
use crate::resolver::BackendResolver;
use crate::retention::MaintenancePlan;
use crate::summary::{FileSummaryStore, SummaryStore};

/// Orphaned recovery caches younger than this are never swept.
pub const ORPHAN_CACHE_MIN_AGE: Duration = Duration::from_secs(60 * 60);
/// Slack past the request timeout before a cache counts as orphaned.
pub const ORPHAN_CACHE_MARGIN: Duration = Duration::from_secs(10 * 60);

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,
    /// Identity reported in health checks and used as the rate-limit key.
    #[arg(long, env = "INSTANCE_NAME", default_value = "worker-local")]
    pub worker_id: String,
    /// JSON provider catalog. Without one, a single local CLI provider is used.
    #[arg(long, env = "SWITCHYARD_PROVIDERS")]
    pub providers: Option<PathBuf>,
    /// Overrides the catalog's default provider.
    #[arg(long, env = "SWITCHYARD_DEFAULT_PROVIDER")]
    pub default_provider: Option<String>,
    #[arg(long, env = "SWITCHYARD_REQUEST_TIMEOUT_SECS", default_value_t = 2400)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    /// Directory for crash-recovery caches. Defaults to `switchyard/` under the
    /// system temp dir.
    #[arg(long, env = "SWITCHYARD_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_CACHE_BUDGET_BYTES)]
    pub cache_budget_bytes: u64,
    #[arg(long, env = "SWITCHYARD_SUMMARY_DIR", default_value = "summaries")]
    pub summary_dir: PathBuf,
    #[arg(long, default_value_t = 100)]
    pub max_summaries: usize,
    #[arg(long, default_value_t = 24)]
    pub invocation_retention_hours: i64,
    #[arg(long, default_value_t = 3600)]
    pub cleanup_interval_secs: u64,
    #[arg(long, default_value_t = 1500)]
    pub fallback_backoff_ms: u64,
    #[arg(long, default_value_t = 500)]
    pub disconnect_poll_ms: u64,
    #[arg(long, default_value_t = 5000)]
    pub first_chunk_grace_ms: u64,
    #[arg(long, env = "SWITCHYARD_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,
    /// Write the log file as JSON lines instead of plain text.
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,
    #[arg(long, default_value_t = 10)]
    pub default_max_turns: u32,
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,
}

impl Args {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("switchyard"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// A cache is only orphaned once no live request could still own it.
    pub fn orphan_cache_age(&self) -> Duration {
        (self.request_timeout() + ORPHAN_CACHE_MARGIN).max(ORPHAN_CACHE_MIN_AGE)
    }

    pub fn maintenance_plan(&self) -> MaintenancePlan {
        MaintenancePlan {
            log_dir: self.log_dir.clone(),
            cache_dir: self.cache_dir(),
            summary_dir: self.summary_dir.clone(),
            orphan_cache_age: self.orphan_cache_age(),
            max_summaries: self.max_summaries,
            invocation_retention: chrono::Duration::hours(self.invocation_retention_hours),
        }
    }
}

/// Every service a request handler needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub args: Arc<Args>,
    pub worker_id: String,
    pub registry: Arc<InvocationRegistry>,
    pub rate_limits: Arc<RateLimitTracker>,
    pub health: Arc<ProviderHealthTracker>,
    pub metrics: Arc<OutcomeMetrics>,
    pub resolver: Arc<dyn BackendResolver>,
    pub executor: Arc<RequestExecutor>,
    pub orchestrator: Arc<FallbackOrchestrator>,
    pub monitor: DisconnectMonitor,
}

impl AppState {
    /// Wires the services together. The backend and resolver are injected so
    /// tests can substitute scripted ones.
    pub fn build(
        args: Args,
        backend: Arc<dyn Backend>,
        resolver: Arc<dyn BackendResolver>,
        fallback_chains: HashMap<String, Vec<String>>,
    ) -> Self {
        let summaries: Arc<dyn SummaryStore> = Arc::new(FileSummaryStore::new(
            args.summary_dir.clone(),
            args.max_summaries,
        ));
        Self::build_with_summaries(args, backend, resolver, fallback_chains, summaries)
    }

    pub fn build_with_summaries(
        args: Args,
        backend: Arc<dyn Backend>,
        resolver: Arc<dyn BackendResolver>,
        fallback_chains: HashMap<String, Vec<String>>,
        summaries: Arc<dyn SummaryStore>,
    ) -> Self {
        let registry = Arc::new(InvocationRegistry::new());
        let rate_limits = Arc::new(RateLimitTracker::new());
        let health = Arc::new(ProviderHealthTracker::new());
        let metrics = Arc::new(OutcomeMetrics::new());

        let executor = Arc::new(RequestExecutor::new(
            backend,
            registry.clone(),
            rate_limits.clone(),
            CrashRecoveryCache::new(args.cache_dir(), args.cache_budget_bytes),
            summaries,
            metrics.clone(),
            args.worker_id.clone(),
            args.request_timeout(),
        ));
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            fallback_chains,
            health.clone(),
            Duration::from_millis(args.fallback_backoff_ms),
        ));
        let monitor = DisconnectMonitor::new(
            Duration::from_millis(args.first_chunk_grace_ms),
            Duration::from_millis(args.disconnect_poll_ms),
        );

        Self {
            worker_id: args.worker_id.clone(),
            args: Arc::new(args),
            registry,
            rate_limits,
            health,
            metrics,
            resolver,
            executor,
            orchestrator,
            monitor,
        }
    }

    /// Provider used when a request names none.
    pub fn default_provider(&self) -> String {
        self.args
            .default_provider
            .clone()
            .unwrap_or_else(|| self.resolver.default_provider().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["switchyard", "--port", "9000"]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.request_timeout(), Duration::from_secs(2400));
        assert_eq!(args.fallback_backoff_ms, 1500);
        assert_eq!(
            args.maintenance_plan().orphan_cache_age,
            Duration::from_secs(2400) + ORPHAN_CACHE_MARGIN
        );
        assert!(args.cache_dir().ends_with("switchyard"));
    }

    #[test]
    fn test_orphan_cache_age_tracks_request_timeout() {
        let short = Args::parse_from(["switchyard", "--request-timeout-secs", "60"]);
        assert_eq!(short.orphan_cache_age(), ORPHAN_CACHE_MIN_AGE);

        let long = Args::parse_from(["switchyard", "--request-timeout-secs", "7200"]);
        assert_eq!(
            long.orphan_cache_age(),
            Duration::from_secs(7200) + ORPHAN_CACHE_MARGIN
        );
    }
}
