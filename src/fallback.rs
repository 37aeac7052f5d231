use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::BackendConfig;
use crate::constants::{RETRYABLE_MESSAGE_MARKERS, RETRYABLE_STATUS_CODES};
use crate::health::ProviderHealthTracker;
use crate::types::{ObservedError, RelayError, Result};

pub const DEFAULT_FALLBACK_BACKOFF: Duration = Duration::from_millis(1500);

/// Whether a provider failure justifies trying the next provider in the chain.
pub fn is_retryable(err: &ObservedError) -> bool {
    match &err.inner {
        RelayError::WorkerUnavailable { .. } => true,
        RelayError::Upstream(status, _) => RETRYABLE_STATUS_CODES.contains(&status.as_u16()),
        RelayError::Network(e) => {
            e.is_connect()
                || e.is_timeout()
                || e.status()
                    .is_some_and(|s| RETRYABLE_STATUS_CODES.contains(&s.as_u16()))
        }
        RelayError::Backend(msg) | RelayError::Internal(msg, _) => {
            crate::str_utils::find_phrase(msg, RETRYABLE_MESSAGE_MARKERS).is_some()
        }
        RelayError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
        ),
        // Timeout and crashes have already produced output for the caller.
        RelayError::Timeout(_)
        | RelayError::BackendCrashed { .. }
        | RelayError::EmptyResponse(_)
        | RelayError::Configuration(_)
        | RelayError::Cancelled(_)
        | RelayError::Serialization(_)
        | RelayError::InvalidRequest(_)
        | RelayError::NotFound(_)
        | RelayError::Conflict(_) => false,
    }
}

/// Walks `[primary] + fallbacks(primary)` until one provider succeeds.
pub struct FallbackOrchestrator {
    chains: HashMap<String, Vec<String>>,
    health: Arc<ProviderHealthTracker>,
    backoff: Duration,
}

impl FallbackOrchestrator {
    pub fn new(
        chains: HashMap<String, Vec<String>>,
        health: Arc<ProviderHealthTracker>,
        backoff: Duration,
    ) -> Self {
        Self {
            chains,
            health,
            backoff,
        }
    }

    pub fn chain_for(&self, primary: &str) -> Vec<String> {
        let mut chain = vec![primary.to_string()];
        if let Some(fallbacks) = self.chains.get(primary) {
            chain.extend(fallbacks.iter().filter(|p| p.as_str() != primary).cloned());
        }
        chain
    }

    pub async fn execute_with_fallback<T, E, Fut, R>(
        &self,
        primary: &str,
        mut execute: E,
        mut resolve: R,
    ) -> Result<T>
    where
        E: FnMut(BackendConfig, String) -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(&str) -> Result<BackendConfig>,
    {
        let chain = self.chain_for(primary);
        let mut last_error: Option<ObservedError> = None;

        for (idx, provider_id) in chain.iter().enumerate() {
            let attempt = idx + 1;
            let outcome = match resolve(provider_id) {
                Ok(config) => execute(config, provider_id.clone()).await,
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(value) => {
                    self.health.record_success(provider_id);
                    if attempt > 1 {
                        tracing::info!(
                            provider = %provider_id,
                            primary = %primary,
                            attempt,
                            "Fallback provider succeeded"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if matches!(err.inner, RelayError::Cancelled(_)) {
                // Caller went away; says nothing about the provider.
                return Err(err);
            }
            self.health.record_failure(provider_id, &err.inner.to_string());

            if !is_retryable(&err) {
                tracing::debug!(provider = %provider_id, "Non-retryable failure: {}", err.inner);
                return Err(err);
            }

            if attempt < chain.len() {
                tracing::warn!(
                    provider = %provider_id,
                    attempt,
                    "Provider failed: {}. Falling back to {} in {:?}...",
                    err.inner,
                    chain[attempt],
                    self.backoff
                );
                tokio::time::sleep(self.backoff).await;
            } else if chain.len() > 1 {
                tracing::error!(
                    primary = %primary,
                    "All {} providers in the fallback chain failed",
                    chain.len()
                );
            }
            last_error = Some(err);
        }

        Err(last_error.unwrap_or_else(|| {
            RelayError::Internal(
                format!("empty fallback chain for '{}'", primary),
                tracing_error::SpanTrace::capture(),
            )
            .into()
        }))
    }
}
