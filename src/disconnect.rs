use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::registry::InvocationRegistry;
use crate::types::{InvocationId, InvocationStatus};

/// Whether the caller behind a request is still there.
pub trait CallerLiveness: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Liveness backed by a token that fires when the response body (or the
/// handler future) holding its drop guard goes away.
#[derive(Clone, Debug)]
pub struct ConnectionLiveness {
    gone: CancellationToken,
}

impl ConnectionLiveness {
    /// Returns the liveness handle and the guard that marks the caller gone
    /// when dropped.
    pub fn new() -> (Self, tokio_util::sync::DropGuard) {
        let gone = CancellationToken::new();
        let guard = gone.clone().drop_guard();
        (Self { gone }, guard)
    }
}

impl CallerLiveness for ConnectionLiveness {
    fn is_connected(&self) -> bool {
        !self.gone.is_cancelled()
    }
}

/// What the executor publishes for the monitor: the invocation currently
/// serving the request (it changes when the fallback chain moves on) and
/// whether the first chunk has reached the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSignal {
    pub invocation: Option<InvocationId>,
    pub streaming: bool,
}

pub type StreamSignalReceiver = watch::Receiver<StreamSignal>;

#[derive(Debug, Clone, Copy)]
pub struct DisconnectMonitor {
    pub first_chunk_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for DisconnectMonitor {
    fn default() -> Self {
        Self {
            first_chunk_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl DisconnectMonitor {
    pub fn new(first_chunk_grace: Duration, poll_interval: Duration) -> Self {
        Self {
            first_chunk_grace,
            poll_interval,
        }
    }

    /// Runs until the caller disconnects (cancelling the current invocation),
    /// the invocation reaches a terminal state, or the request finishes.
    /// Returns true if it cancelled something.
    pub async fn watch<L: CallerLiveness>(
        self,
        liveness: L,
        mut signal: StreamSignalReceiver,
        registry: Arc<InvocationRegistry>,
    ) -> bool {
        // Give the backend a bounded moment to produce its first chunk before
        // the first liveness check.
        let wait_first = async {
            while !signal.borrow_and_update().streaming {
                if signal.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(self.first_chunk_grace, wait_first)
            .await
            .is_err()
        {
            tracing::debug!("No chunk within {:?}, monitoring anyway", self.first_chunk_grace);
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let current = signal.borrow().invocation.clone();
            let sender_gone = signal.has_changed().is_err();

            if let Some(id) = &current {
                let status = registry.get(id).map(|inv| inv.status);
                if sender_gone && status != Some(InvocationStatus::Running) {
                    return false;
                }
            } else if sender_gone {
                return false;
            }

            if liveness.is_connected() {
                continue;
            }

            return match current {
                Some(id) => {
                    let cancelled = registry.cancel(&id);
                    if cancelled {
                        tracing::info!(invocation = %id.short(), "Caller disconnected, invocation cancelled");
                    }
                    cancelled
                }
                None => {
                    tracing::debug!("Caller disconnected before any invocation started");
                    false
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(Arc<AtomicBool>);

    impl CallerLiveness for Flag {
        fn is_connected(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn fast() -> DisconnectMonitor {
        DisconnectMonitor::new(Duration::from_millis(200), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_cancels_running_invocation_on_disconnect() {
        let registry = Arc::new(InvocationRegistry::new());
        let inv = registry.create("p", "m");
        let (tx, rx) = watch::channel(StreamSignal {
            invocation: Some(inv.id.clone()),
            streaming: true,
        });
        let connected = Arc::new(AtomicBool::new(true));

        let handle = tokio::spawn(fast().watch(Flag(connected.clone()), rx, registry.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        connected.store(false, Ordering::SeqCst);

        assert!(handle.await.unwrap());
        assert!(inv.is_cancelled());
        drop(tx);
    }

    #[tokio::test]
    async fn test_stops_when_request_finishes() {
        let registry = Arc::new(InvocationRegistry::new());
        let inv = registry.create("p", "m");
        let (tx, rx) = watch::channel(StreamSignal {
            invocation: Some(inv.id.clone()),
            streaming: false,
        });
        registry.complete(&inv.id, InvocationStatus::Completed);
        drop(tx);

        let cancelled = fast()
            .watch(Flag(Arc::new(AtomicBool::new(true))), rx, registry)
            .await;
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn test_cancels_before_first_chunk_after_grace() {
        let registry = Arc::new(InvocationRegistry::new());
        let inv = registry.create("p", "m");
        let (_tx, rx) = watch::channel(StreamSignal {
            invocation: Some(inv.id.clone()),
            streaming: false,
        });
        let monitor = DisconnectMonitor::new(Duration::from_millis(20), Duration::from_millis(10));

        let cancelled = monitor
            .watch(Flag(Arc::new(AtomicBool::new(false))), rx, registry.clone())
            .await;
        assert!(cancelled);
        assert!(inv.is_cancelled());
    }

    #[test]
    fn test_connection_liveness_follows_guard() {
        let (liveness, guard) = ConnectionLiveness::new();
        assert!(liveness.is_connected());
        drop(guard);
        assert!(!liveness.is_connected());
    }
}
