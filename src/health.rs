use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::AppState;

/// Failures in a row at which a provider is reported as down.
const DOWN_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Up,
    Degraded,
    Down,
}

pub struct ProviderHealth {
    pub consecutive_failures: AtomicU32,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub last_success: RwLock<Option<DateTime<Utc>>>,
    pub last_error: RwLock<Option<DateTime<Utc>>>,
    pub last_error_message: RwLock<Option<String>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_success: RwLock::new(None),
            last_error: RwLock::new(None),
            last_error_message: RwLock::new(None),
        }
    }
}

impl ProviderHealth {
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.write() {
            *last = Some(Utc::now());
        }
    }

    pub fn record_failure(&self, message: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.write() {
            *last = Some(Utc::now());
        }
        if let Ok(mut msg) = self.last_error_message.write() {
            *msg = Some(crate::str_utils::prefix_chars(message, 500).to_string());
        }
    }

    pub fn status(&self) -> ProviderStatus {
        match self.consecutive_failures.load(Ordering::Relaxed) {
            0 => ProviderStatus::Up,
            n if n < DOWN_THRESHOLD => ProviderStatus::Degraded,
            _ => ProviderStatus::Down,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthSnapshot {
    pub provider_id: String,
    pub status: ProviderStatus,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
}

/// Health records per provider, created lazily on first attempt.
#[derive(Default)]
pub struct ProviderHealthTracker {
    providers: RwLock<HashMap<String, Arc<ProviderHealth>>>,
}

impl ProviderHealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, provider_id: &str) -> Arc<ProviderHealth> {
        if let Some(h) = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
        {
            return h.clone();
        }
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(provider_id.to_string())
            .or_default()
            .clone()
    }

    pub fn record_success(&self, provider_id: &str) {
        self.entry(provider_id).record_success();
    }

    pub fn record_failure(&self, provider_id: &str, message: &str) {
        let health = self.entry(provider_id);
        health.record_failure(message);
        if health.status() == ProviderStatus::Down {
            tracing::warn!(
                provider = %provider_id,
                failures = health.consecutive_failures.load(Ordering::Relaxed),
                "Provider marked down"
            );
        }
    }

    pub fn get(&self, provider_id: &str) -> Option<ProviderHealthSnapshot> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        providers.get(provider_id).map(|h| snapshot_of(provider_id, h))
    }

    pub fn snapshot(&self) -> Vec<ProviderHealthSnapshot> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = providers
            .iter()
            .map(|(id, h)| snapshot_of(id, h))
            .collect();
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        out
    }
}

fn snapshot_of(provider_id: &str, h: &ProviderHealth) -> ProviderHealthSnapshot {
    ProviderHealthSnapshot {
        provider_id: provider_id.to_string(),
        status: h.status(),
        consecutive_failures: h.consecutive_failures.load(Ordering::Relaxed),
        total_requests: h.total_requests.load(Ordering::Relaxed),
        failed_requests: h.failed_requests.load(Ordering::Relaxed),
        last_success: h.last_success.read().ok().and_then(|g| *g),
        last_error: h.last_error.read().ok().and_then(|g| *g),
        last_error_message: h.last_error_message.read().ok().and_then(|g| g.clone()),
    }
}

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub worker_instance: String,
    pub rate_limited: bool,
    pub retry_after_seconds: Option<u64>,
    pub running_invocations: usize,
    pub providers: Vec<ProviderHealthSnapshot>,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let worker = state.worker_id.as_str();
    let rate_limited = state.rate_limits.is_rate_limited(worker);
    Json(HealthResponse {
        status: if rate_limited { "rate_limited" } else { "healthy" },
        worker_instance: worker.to_string(),
        rate_limited,
        retry_after_seconds: state.rate_limits.retry_after_seconds(worker),
        running_invocations: state.registry.stats().running,
        providers: state.health.snapshot(),
    })
}
