//! Per-provider outcome counters.
//!
//! Aggregates how invocations ended so operators can see which providers are
//! rate limiting, crashing or timing out without grepping logs.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// How one invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    /// Stream ended without a completion marker.
    Incomplete,
    RateLimited,
    WorkerUnavailable,
    TimedOut,
    CrashRecovered,
    CrashUnrecovered,
    EmptyResponse,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderMetrics {
    pub completed: u64,
    pub incomplete: u64,
    pub rate_limited: u64,
    pub worker_unavailable: u64,
    pub timed_out: u64,
    pub crash_recovered: u64,
    pub crash_unrecovered: u64,
    pub empty_response: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub chunks_forwarded: u64,
}

impl ProviderMetrics {
    pub fn total(&self) -> u64 {
        self.completed
            + self.incomplete
            + self.rate_limited
            + self.worker_unavailable
            + self.timed_out
            + self.crash_recovered
            + self.crash_unrecovered
            + self.empty_response
            + self.cancelled
            + self.failed
    }
}

pub struct OutcomeMetrics {
    metrics: Arc<RwLock<HashMap<String, ProviderMetrics>>>,
}

impl OutcomeMetrics {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn record(&self, provider: &str, outcome: Outcome, chunks_forwarded: usize) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(provider.to_string()).or_default();
        entry.chunks_forwarded += chunks_forwarded as u64;
        let counter = match outcome {
            Outcome::Completed => &mut entry.completed,
            Outcome::Incomplete => &mut entry.incomplete,
            Outcome::RateLimited => &mut entry.rate_limited,
            Outcome::WorkerUnavailable => &mut entry.worker_unavailable,
            Outcome::TimedOut => &mut entry.timed_out,
            Outcome::CrashRecovered => &mut entry.crash_recovered,
            Outcome::CrashUnrecovered => &mut entry.crash_unrecovered,
            Outcome::EmptyResponse => &mut entry.empty_response,
            Outcome::Cancelled => &mut entry.cancelled,
            Outcome::Failed => &mut entry.failed,
        };
        *counter += 1;
    }

    pub async fn get_metrics(&self, provider: &str) -> Option<ProviderMetrics> {
        self.metrics.read().await.get(provider).cloned()
    }

    pub async fn get_all_metrics(&self) -> HashMap<String, ProviderMetrics> {
        self.metrics.read().await.clone()
    }

    /// Log aggregated metrics summary
    pub async fn log_summary(&self) {
        let metrics = self.metrics.read().await;
        if metrics.is_empty() {
            return;
        }

        tracing::info!("=== OUTCOME SUMMARY ===");
        for (provider, m) in metrics.iter() {
            let failure_rate = if m.total() > 0 {
                ((m.total() - m.completed - m.incomplete) as f64 / m.total() as f64) * 100.0
            } else {
                0.0
            };
            tracing::info!(
                "Provider {}: {} invocations | {:.1}% failed | {} rate-limited | {} timed out | {} crashed",
                provider,
                m.total(),
                failure_rate,
                m.rate_limited,
                m.timed_out,
                m.crash_recovered + m.crash_unrecovered
            );
        }
        tracing::info!("=======================");
    }
}

impl Default for OutcomeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_per_provider() {
        let metrics = OutcomeMetrics::new();
        metrics.record("cli", Outcome::Completed, 4).await;
        metrics.record("cli", Outcome::TimedOut, 0).await;
        metrics.record("router", Outcome::RateLimited, 0).await;

        let cli = metrics.get_metrics("cli").await.unwrap();
        assert_eq!(cli.completed, 1);
        assert_eq!(cli.timed_out, 1);
        assert_eq!(cli.chunks_forwarded, 4);
        assert_eq!(cli.total(), 2);

        let all = metrics.get_all_metrics().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all["router"].rate_limited, 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_has_no_metrics() {
        let metrics = OutcomeMetrics::new();
        assert!(metrics.get_metrics("nobody").await.is_none());
        metrics.log_summary().await;
    }
}
