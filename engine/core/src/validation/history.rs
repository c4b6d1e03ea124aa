//! Validation history persistence
//!
//! Results are append-only. [`JsonlHistoryStore`] writes one JSON document
//! per line so the file can be tailed and grepped; [`InMemoryHistory`] backs
//! tests and degraded deployments.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::harness::ValidationResult;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode validation result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only store of validation runs
#[async_trait]
pub trait ValidationHistoryStore: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, result: &ValidationResult) -> Result<(), HistoryError>;

    /// Most recent runs first, at most `limit`
    async fn recent(&self, limit: usize) -> Result<Vec<ValidationResult>, HistoryError>;

    async fn latest(&self) -> Result<Option<ValidationResult>, HistoryError> {
        Ok(self.recent(1).await?.into_iter().next())
    }
}

/// Process-local history
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    runs: RwLock<Vec<ValidationResult>>,
}

impl InMemoryHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ValidationHistoryStore for InMemoryHistory {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, result: &ValidationResult) -> Result<(), HistoryError> {
        self.runs.write().push(result.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ValidationResult>, HistoryError> {
        Ok(self.runs.read().iter().rev().take(limit).cloned().collect())
    }
}

/// JSON lines file
#[derive(Debug, Clone)]
pub struct JsonlHistoryStore {
    path: PathBuf,
}

impl JsonlHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Make sure the file can be opened for appending
    pub async fn ping(&self) -> Result<(), HistoryError> {
        self.open().await.map(|_| ())
    }

    async fn open(&self) -> Result<tokio::fs::File, HistoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}

#[async_trait]
impl ValidationHistoryStore for JsonlHistoryStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&self, result: &ValidationResult) -> Result<(), HistoryError> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');
        let mut file = self.open().await?;
        file.write_all(&line).await.map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ValidationResult>, HistoryError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut runs = Vec::new();
        for line in text.lines().rev().filter(|l| !l.trim().is_empty()) {
            if runs.len() == limit {
                break;
            }
            match serde_json::from_str::<ValidationResult>(line) {
                Ok(run) => runs.push(run),
                // A torn final line from an interrupted append is skipped
                Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "skipping unreadable history line"),
            }
        }
        Ok(runs)
    }
}
