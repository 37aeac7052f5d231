//! Bounded on-disk artifacts.
//!
//! Rolling log files, orphaned recovery caches left by a killed process, and
//! final summaries all accumulate in directories nobody else cleans. The
//! sweeper applies an age, total-size and file-count policy to every file in a
//! directory whose name starts with a given prefix.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::constants::{CACHE_FILE_PREFIX, LOG_FILE_PREFIX, SUMMARY_FILE_PREFIX};
use crate::metrics::OutcomeMetrics;
use crate::registry::InvocationRegistry;

#[derive(Clone, Debug)]
pub struct RetentionPolicy {
    pub max_files: usize,
    pub max_age: Duration,
    pub max_total_size_bytes: u64,
    /// Never delete the newest matching file, even when it breaks a limit.
    /// Right for logs (the newest one is being written), wrong for caches.
    pub keep_newest: bool,
}

impl RetentionPolicy {
    pub fn logs() -> Self {
        Self {
            max_files: 512,
            max_age: Duration::from_secs(60 * 60 * 60),
            max_total_size_bytes: 5 * 1024 * 1024 * 1024,
            keep_newest: true,
        }
    }

    /// A live invocation never outlives the request timeout, so anything
    /// older than that is an orphan.
    pub fn orphaned_caches(max_age: Duration) -> Self {
        Self {
            max_files: usize::MAX,
            max_age,
            max_total_size_bytes: u64::MAX,
            keep_newest: false,
        }
    }

    pub fn summaries(max_files: usize) -> Self {
        Self {
            max_files,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_total_size_bytes: 512 * 1024 * 1024,
            keep_newest: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetentionSweeper {
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    /// Applies the policy to files in `dir` whose name starts with `prefix`.
    /// Returns how many were removed. A missing directory is not an error.
    pub fn sweep(&self, dir: &Path, prefix: &str) -> std::io::Result<usize> {
        let mut files = find_files(dir, prefix)?;
        if files.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        removed += self.cleanup_by_age(&mut files);
        removed += self.cleanup_by_total_size(&mut files);
        removed += self.cleanup_by_max_files(&mut files);
        Ok(removed)
    }

    fn protected(&self, files: &[PathBuf]) -> usize {
        usize::from(self.policy.keep_newest && !files.is_empty())
    }

    fn cleanup_by_age(&self, files: &mut Vec<PathBuf>) -> usize {
        let now = SystemTime::now();
        let newest_idx = files.len().saturating_sub(1);
        let mut removed = 0;
        let mut kept = Vec::with_capacity(files.len());

        for (idx, path) in files.drain(..).enumerate() {
            if self.policy.keep_newest && idx == newest_idx {
                kept.push(path);
                continue;
            }
            // Unstattable files are left alone.
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => {
                    kept.push(path);
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > self.policy.max_age && remove(&path) {
                removed += 1;
            } else {
                kept.push(path);
            }
        }

        *files = kept;
        removed
    }

    fn cleanup_by_total_size(&self, files: &mut Vec<PathBuf>) -> usize {
        let mut removed = 0;
        let mut total = total_size_bytes(files);
        while total > self.policy.max_total_size_bytes && files.len() > self.protected(files) {
            let oldest = files.remove(0);
            if remove(&oldest) {
                removed += 1;
            }
            total = total_size_bytes(files);
        }
        removed
    }

    fn cleanup_by_max_files(&self, files: &mut Vec<PathBuf>) -> usize {
        if files.len() <= self.policy.max_files {
            return 0;
        }
        let max_remove = files.len().saturating_sub(self.protected(files));
        let requested = files.len().saturating_sub(self.policy.max_files);
        let to_remove = max_remove.min(requested);

        files.drain(..to_remove).filter(|path| remove(path)).count()
    }
}

fn remove(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!("Failed to remove {:?}: {}", path, e);
            false
        }
    }
}

fn total_size_bytes(files: &[PathBuf]) -> u64 {
    files
        .iter()
        .filter_map(|p| fs::metadata(p).ok())
        .fold(0u64, |acc, m| acc.saturating_add(m.len()))
}

/// Matching files sorted oldest first.
fn find_files(dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with(prefix));
        if matches {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((path, modified));
        }
    }

    files.sort_by_key(|(_, modified)| *modified);
    Ok(files.into_iter().map(|(p, _)| p).collect())
}

/// Directories and limits for the periodic maintenance pass.
#[derive(Clone, Debug)]
pub struct MaintenancePlan {
    pub log_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub summary_dir: PathBuf,
    pub orphan_cache_age: Duration,
    pub max_summaries: usize,
    pub invocation_retention: chrono::Duration,
}

impl MaintenancePlan {
    /// One pass over every artifact directory. Failures are logged, never
    /// propagated.
    pub fn sweep_artifacts(&self) -> usize {
        let passes = [
            (RetentionPolicy::logs(), &self.log_dir, LOG_FILE_PREFIX),
            (
                RetentionPolicy::orphaned_caches(self.orphan_cache_age),
                &self.cache_dir,
                CACHE_FILE_PREFIX,
            ),
            (
                RetentionPolicy::summaries(self.max_summaries),
                &self.summary_dir,
                SUMMARY_FILE_PREFIX,
            ),
        ];

        let mut removed = 0;
        for (policy, dir, prefix) in passes {
            match RetentionSweeper::new(policy).sweep(dir, prefix) {
                Ok(n) => removed += n,
                Err(e) => tracing::warn!("Retention sweep of {:?} failed: {}", dir, e),
            }
        }
        if removed > 0 {
            tracing::info!("Retention sweep removed {} files", removed);
        }
        removed
    }
}

/// Periodic housekeeping: artifact retention, registry cleanup and the
/// outcome summary log line. Runs until the task is aborted.
pub async fn run_maintenance(
    plan: MaintenancePlan,
    registry: Arc<InvocationRegistry>,
    metrics: Arc<OutcomeMetrics>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already swept.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let sweep_plan = plan.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || sweep_plan.sweep_artifacts()).await {
            tracing::error!("Retention sweep task failed: {}", e);
        }

        let purged = registry.cleanup(plan.invocation_retention);
        if purged > 0 {
            tracing::info!("Purged {} finished invocations", purged);
        }

        metrics.log_summary().await;
    }
}
