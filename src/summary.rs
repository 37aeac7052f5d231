use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::chunks::ResponseChunk;
use crate::constants::SUMMARY_FILE_PREFIX;
use crate::types::{InvocationId, InvocationStatus};

/// Final record persisted once per invocation for post-hoc inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub invocation_id: InvocationId,
    pub provider_id: String,
    pub model: String,
    pub status: InvocationStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub chunks_forwarded: usize,
    pub text_chars: usize,
    pub word_count: usize,
    pub tools_used: Vec<String>,
    pub response_complete: bool,
}

/// Accumulates what was forwarded during one invocation.
#[derive(Debug, Default)]
pub struct RunTally {
    pub chunks: usize,
    pub text: String,
    pub tool_names: BTreeSet<String>,
}

impl RunTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, chunk: &ResponseChunk) {
        self.chunks += 1;
        match chunk {
            ResponseChunk::Content { text } => self.text.push_str(text),
            ResponseChunk::ToolUse { name, .. } if !name.is_empty() => {
                self.tool_names.insert(name.clone());
            }
            _ => {}
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    pub fn log_summary(&self, invocation_id: &InvocationId, status: InvocationStatus) {
        let tools_str = if self.tool_names.is_empty() {
            "0".to_string()
        } else {
            let names: Vec<&str> = self.tool_names.iter().map(String::as_str).collect();
            format!("{} ({})", names.len(), names.join(", "))
        };

        tracing::info!(
            target: "flight_recorder",
            "[STREAM END] Invocation: {} | Status: {} | Chunks: {} | Tools: {} | Text: {} chars",
            invocation_id.short(),
            status,
            self.chunks,
            tools_str,
            self.text.len()
        );
    }
}

/// Write-once-per-invocation sink. Callers swallow its errors.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn write(&self, summary: &RunSummary) -> std::io::Result<()>;
}

/// Stores one JSON file per invocation and keeps the directory bounded.
#[derive(Debug, Clone)]
pub struct FileSummaryStore {
    dir: PathBuf,
    max_files: usize,
}

impl FileSummaryStore {
    pub fn new(dir: impl Into<PathBuf>, max_files: usize) -> Self {
        Self {
            dir: dir.into(),
            max_files,
        }
    }

    pub fn path_for(&self, id: &InvocationId) -> PathBuf {
        let safe_id = id.0.replace(['/', '\\', ':'], "_");
        self.dir.join(format!("{}{}.json", SUMMARY_FILE_PREFIX, safe_id))
    }

    async fn cleanup_old_summaries(&self) {
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = read_dir.next_entry().await {
            if !entry.file_name().to_string_lossy().starts_with(SUMMARY_FILE_PREFIX) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.is_file() {
                let modified = metadata
                    .modified()
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                entries.push((entry.path(), modified));
            }
        }

        if entries.len() <= self.max_files {
            return;
        }
        entries.sort_by_key(|e| e.1);
        let excess = entries.len() - self.max_files;
        for (path, _) in entries.into_iter().take(excess) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::error!("Failed to delete old summary {:?}: {}", path, e),
            }
        }
    }
}

#[async_trait]
impl SummaryStore for FileSummaryStore {
    async fn write(&self, summary: &RunSummary) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(summary).map_err(std::io::Error::other)?;
        let path = self.path_for(&summary.invocation_id);
        tokio::fs::write(&path, json).await?;
        tracing::debug!("Final summary saved to {:?}", path);
        self.cleanup_old_summaries().await;
        Ok(())
    }
}
