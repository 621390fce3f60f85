//! Run tracking store.
//!
//! Finished runs are persisted for later query after evaluation. Writes
//! happen in the background; a failed write is logged, never fatal.

use crate::error::TrackingError;
use crate::models::{EvaluationRecord, RunResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub recorded_at: DateTime<Utc>,
    pub result: RunResult,
    pub evaluation: EvaluationRecord,
}

#[async_trait]
pub trait RunTracker: Send + Sync {
    async fn record(
        &self,
        result: &RunResult,
        evaluation: &EvaluationRecord,
    ) -> Result<(), TrackingError>;
}

/// Appends one JSON line per run to a file.
#[derive(Debug)]
pub struct JsonlTracker {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    write_lock: Mutex<()>,
}

impl JsonlTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Read every record back, oldest first.
    #[cfg(test)]
    pub async fn load(&self) -> Result<Vec<TrackingRecord>, TrackingError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(TrackingError::from))
            .collect()
    }
}

#[async_trait]
impl RunTracker for JsonlTracker {
    async fn record(
        &self,
        result: &RunResult,
        evaluation: &EvaluationRecord,
    ) -> Result<(), TrackingError> {
        let record = TrackingRecord {
            recorded_at: Utc::now(),
            result: result.clone(),
            evaluation: evaluation.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
