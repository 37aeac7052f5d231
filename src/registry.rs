use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use crate::constants::PROMPT_PREVIEW_CHARS;
use crate::types::{InvocationId, InvocationStatus};

/// Snapshot of one tracked invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Invocation {
    pub id: InvocationId,
    pub prompt_preview: String,
    pub model: String,
    pub status: InvocationStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

impl Invocation {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Owns every tracked invocation. The map lock is held only long enough to
/// find an entry; transitions on one invocation are serialized by that
/// entry's own mutex.
#[derive(Default)]
pub struct InvocationRegistry {
    invocations: RwLock<HashMap<InvocationId, Arc<Mutex<Invocation>>>>,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, prompt: &str, model: &str) -> Invocation {
        let invocation = Invocation {
            id: InvocationId::new(),
            prompt_preview: crate::str_utils::prefix_chars(prompt, PROMPT_PREVIEW_CHARS).to_string(),
            model: model.to_string(),
            status: InvocationStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            cancellation: CancellationToken::new(),
        };
        self.write_map()
            .insert(invocation.id.clone(), Arc::new(Mutex::new(invocation.clone())));
        tracing::debug!(invocation = %invocation.id.short(), model = %model, "Invocation registered");
        invocation
    }

    pub fn get(&self, id: &InvocationId) -> Option<Invocation> {
        let entry = self.entry(id)?;
        let inv = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Some(inv.clone())
    }

    pub fn list(&self, status: Option<InvocationStatus>) -> Vec<Invocation> {
        let entries: Vec<_> = self.read_map().values().cloned().collect();
        let mut out: Vec<Invocation> = entries
            .iter()
            .map(|e| e.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .filter(|inv| status.map_or(true, |s| inv.status == s))
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Signals cancellation. Returns false unless the invocation exists and is
    /// still running.
    pub fn cancel(&self, id: &InvocationId) -> bool {
        let entry = match self.entry(id) {
            Some(e) => e,
            None => return false,
        };
        let inv = entry.lock().unwrap_or_else(PoisonError::into_inner);
        if inv.status != InvocationStatus::Running {
            return false;
        }
        inv.cancellation.cancel();
        tracing::info!(invocation = %id.short(), "Cancellation requested");
        true
    }

    /// Moves a running invocation to a terminal status. Later calls are
    /// ignored, so the first terminal status wins.
    pub fn complete(&self, id: &InvocationId, status: InvocationStatus) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let entry = match self.entry(id) {
            Some(e) => e,
            None => return false,
        };
        let mut inv = entry.lock().unwrap_or_else(PoisonError::into_inner);
        if inv.status.is_terminal() {
            tracing::debug!(
                invocation = %id.short(),
                current = %inv.status,
                requested = %status,
                "Ignoring repeated terminal transition"
            );
            return false;
        }
        inv.status = status;
        inv.completed_at = Some(Utc::now());
        true
    }

    /// Removes terminal invocations created more than `max_age` ago.
    pub fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut map = self.write_map();
        let before = map.len();
        map.retain(|_, entry| {
            let inv = entry.lock().unwrap_or_else(PoisonError::into_inner);
            !(inv.status.is_terminal() && inv.created_at < cutoff)
        });
        let removed = before - map.len();
        if removed > 0 {
            tracing::info!("Cleaned up {} old invocations", removed);
        }
        removed
    }

    pub fn delete(&self, id: &InvocationId) -> bool {
        self.write_map().remove(id).is_some()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for inv in self.list(None) {
            stats.total += 1;
            match inv.status {
                InvocationStatus::Running => stats.running += 1,
                InvocationStatus::Completed => stats.completed += 1,
                InvocationStatus::Cancelled => stats.cancelled += 1,
                InvocationStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    fn entry(&self, id: &InvocationId) -> Option<Arc<Mutex<Invocation>>> {
        self.read_map().get(id).cloned()
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<InvocationId, Arc<Mutex<Invocation>>>> {
        self.invocations.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<InvocationId, Arc<Mutex<Invocation>>>> {
        self.invocations.write().unwrap_or_else(PoisonError::into_inner)
    }
}
