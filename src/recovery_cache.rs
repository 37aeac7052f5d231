use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::chunks::ResponseChunk;
use crate::constants::{CACHE_FILE_PREFIX, DEFAULT_CACHE_BUDGET_BYTES};
use crate::types::InvocationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Written,
    Disabled,
}

/// Per-invocation append-only file of emitted chunks. Disabled permanently
/// once the byte budget is exceeded or a write fails.
#[derive(Debug)]
pub struct CacheHandle {
    path: PathBuf,
    bytes_written: u64,
    disabled: bool,
    file: Option<tokio::fs::File>,
}

impl CacheHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[derive(Debug, Default)]
pub struct Replay {
    pub chunks: Vec<ResponseChunk>,
    pub corrupt_lines: usize,
}

#[derive(Debug, Clone)]
pub struct CrashRecoveryCache {
    dir: PathBuf,
    budget_bytes: u64,
}

impl CrashRecoveryCache {
    pub fn new(dir: impl Into<PathBuf>, budget_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            budget_bytes,
        }
    }

    pub fn with_default_budget(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, DEFAULT_CACHE_BUDGET_BYTES)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File names carry invocation id, pid and a random suffix so concurrent
    /// requests and workers sharing a directory never collide.
    pub fn open(&self, invocation_id: &InvocationId) -> CacheHandle {
        let suffix: String = (0..8).map(|_| fastrand::alphanumeric()).collect();
        let name = format!(
            "{}{}_{}_{}.jsonl",
            CACHE_FILE_PREFIX,
            invocation_id,
            std::process::id(),
            suffix
        );
        CacheHandle {
            path: self.dir.join(name),
            bytes_written: 0,
            disabled: false,
            file: None,
        }
    }

    pub async fn append(&self, handle: &mut CacheHandle, chunk: &ResponseChunk) -> AppendOutcome {
        if handle.disabled {
            return AppendOutcome::Disabled;
        }

        let mut line = match serde_json::to_vec(chunk) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("Recovery cache disabled, chunk not serializable: {}", e);
                handle.disabled = true;
                return AppendOutcome::Disabled;
            }
        };
        line.push(b'\n');

        if handle.bytes_written + line.len() as u64 > self.budget_bytes {
            tracing::warn!(
                "Recovery cache budget of {} bytes exceeded, caching disabled for this invocation",
                self.budget_bytes
            );
            handle.disabled = true;
            return AppendOutcome::Disabled;
        }

        if let Err(e) = self.write_line(handle, &line).await {
            tracing::warn!("Recovery cache write failed ({}), caching disabled", e);
            handle.disabled = true;
            return AppendOutcome::Disabled;
        }

        handle.bytes_written += line.len() as u64;
        AppendOutcome::Written
    }

    async fn write_line(&self, handle: &mut CacheHandle, line: &[u8]) -> std::io::Result<()> {
        if handle.file.is_none() {
            tokio::fs::create_dir_all(&self.dir).await?;
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&handle.path)
                .await?;
            handle.file = Some(file);
        }
        match handle.file.as_mut() {
            Some(file) => {
                file.write_all(line).await?;
                file.flush().await
            }
            None => Ok(()),
        }
    }

    /// Reads back whatever was cached. Undecodable lines are skipped and counted.
    pub async fn replay(&self, handle: &CacheHandle) -> Replay {
        let mut replay = Replay::default();
        let file = match tokio::fs::File::open(&handle.path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!("No recovery cache to replay at {:?}: {}", handle.path, e);
                return replay;
            }
        };

        let mut lines = BufReader::new(file).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ResponseChunk>(&line) {
                        Ok(chunk) => replay.chunks.push(chunk),
                        Err(_) => replay.corrupt_lines += 1,
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Invalid UTF-8 or a truncated read; keep what we have.
                    tracing::warn!("Recovery cache read stopped early: {}", e);
                    replay.corrupt_lines += 1;
                    break;
                }
            }
        }

        if replay.corrupt_lines > 0 {
            tracing::warn!(
                "Skipped {} corrupt lines while replaying {:?}",
                replay.corrupt_lines,
                handle.path
            );
        }
        replay
    }

    pub async fn delete(&self, handle: &mut CacheHandle) {
        handle.file = None;
        handle.disabled = true;
        match tokio::fs::remove_file(&handle.path).await {
            Ok(()) => tracing::trace!("Removed recovery cache {:?}", handle.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove recovery cache {:?}: {}", handle.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CrashRecoveryCache::with_default_budget(dir.path());
        let mut handle = cache.open(&InvocationId::from("inv-1"));

        for text in ["a", "b", "c"] {
            assert_eq!(
                cache.append(&mut handle, &ResponseChunk::text(text)).await,
                AppendOutcome::Written
            );
        }

        let replay = cache.replay(&handle).await;
        assert_eq!(
            replay.chunks,
            vec![
                ResponseChunk::text("a"),
                ResponseChunk::text("b"),
                ResponseChunk::text("c")
            ]
        );
        assert_eq!(replay.corrupt_lines, 0);

        cache.delete(&mut handle).await;
        assert!(!handle.path().exists());
    }

    #[tokio::test]
    async fn test_budget_disables_caching() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CrashRecoveryCache::new(dir.path(), 64);
        let mut handle = cache.open(&InvocationId::from("inv-2"));

        assert_eq!(
            cache.append(&mut handle, &ResponseChunk::text("small")).await,
            AppendOutcome::Written
        );
        let big = ResponseChunk::text("x".repeat(100));
        assert_eq!(cache.append(&mut handle, &big).await, AppendOutcome::Disabled);
        assert!(handle.is_disabled());
        // Stays disabled even for chunks that would fit.
        assert_eq!(
            cache.append(&mut handle, &ResponseChunk::text("y")).await,
            AppendOutcome::Disabled
        );
        assert_eq!(cache.replay(&handle).await.chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CrashRecoveryCache::with_default_budget(dir.path());
        let mut handle = cache.open(&InvocationId::from("inv-3"));
        cache.append(&mut handle, &ResponseChunk::text("ok")).await;

        let mut raw = tokio::fs::OpenOptions::new()
            .append(true)
            .open(handle.path())
            .await
            .unwrap();
        raw.write_all(b"{not json\n").await.unwrap();
        raw.flush().await.unwrap();
        cache.append(&mut handle, &ResponseChunk::stop()).await;

        let replay = cache.replay(&handle).await;
        assert_eq!(replay.chunks.len(), 2);
        assert_eq!(replay.corrupt_lines, 1);
    }

    #[tokio::test]
    async fn test_unwritable_directory_disables_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();
        let cache = CrashRecoveryCache::with_default_budget(blocker.join("cache"));
        let mut handle = cache.open(&InvocationId::from("inv-4"));

        assert_eq!(
            cache.append(&mut handle, &ResponseChunk::text("a")).await,
            AppendOutcome::Disabled
        );
        assert!(cache.replay(&handle).await.chunks.is_empty());
    }

    #[test]
    fn test_file_names_are_unique() {
        let cache = CrashRecoveryCache::with_default_budget("/tmp");
        let id = InvocationId::from("same");
        let a = cache.open(&id);
        let b = cache.open(&id);
        assert_ne!(a.path(), b.path());
        let name = a.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("switchyard_recovery_same_"));
    }
}
