//! Telemetry ingestion.
//!
//! This module defines the dataset pulled from the platform's system tables
//! for one analysis window, the content-addressed handle agents receive, and
//! the [`Ingestor`] collaborator interface with its two implementations.

pub mod mock;
pub mod warehouse;

use crate::error::IngestionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

pub use mock::MockIngestor;
pub use warehouse::{WarehouseConfig, WarehouseIngestor};

/// One row of `system.access.audit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_time: DateTime<Utc>,
    pub user_id: String,
    pub service_name: String,
    pub action_name: String,
    pub request_params: String,
    pub response: String,
    pub session_id: String,
    pub source_ip_address: String,
    pub user_agent: String,
}

/// One row of `system.compute.clusters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub cluster_id: String,
    pub cluster_name: String,
    pub state: String,
    pub cluster_source: String,
    pub creator: String,
    pub start_time: Option<DateTime<Utc>>,
    pub last_activity_time: Option<DateTime<Utc>>,
}

/// One row of the query history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: String,
    pub query_text: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Everything ingested for one window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub audit_events: Vec<AuditEvent>,
    pub clusters: Vec<ClusterRecord>,
    pub queries: Vec<QueryRecord>,
}

impl Dataset {
    /// Row counts per table.
    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            audit_events: self.audit_events.len(),
            clusters: self.clusters.len(),
            queries: self.queries.len(),
        }
    }

    /// Whether the window contains any audit activity.
    pub fn has_activity(&self) -> bool {
        !self.audit_events.is_empty()
    }
}

/// Row counts for a dataset, used in logs and reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub audit_events: usize,
    pub clusters: usize,
    pub queries: usize,
}

impl fmt::Display for DatasetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} audit events, {} clusters, {} queries",
            self.audit_events, self.clusters, self.queries
        )
    }
}

/// Opaque handle to an ingested snapshot.
///
/// Identity is the SHA-256 digest of the snapshot's canonical JSON, so two
/// ingestions of identical data yield equal references. Only the digest is
/// serialized; the snapshot itself is shared read-only between agents.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatasetRef {
    digest: String,
    #[serde(skip)]
    snapshot: Arc<Dataset>,
}

impl DatasetRef {
    /// Seal a dataset behind a content-addressed handle.
    pub fn seal(dataset: Dataset) -> Self {
        let canonical = serde_json::to_vec(&dataset).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Self {
            digest: hex::encode(hasher.finalize()),
            snapshot: Arc::new(dataset),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }

    pub fn snapshot(&self) -> &Dataset {
        &self.snapshot
    }
}

impl PartialEq for DatasetRef {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl fmt::Debug for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetRef")
            .field("digest", &self.short())
            .field("summary", &self.snapshot.summary())
            .finish()
    }
}

/// The ingestion collaborator: resolves a time window into a dataset.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn fetch(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<DatasetRef, IngestionError>;
}

#[cfg(test)]
pub(crate) fn audit_event(
    user_id: &str,
    service_name: &str,
    action_name: &str,
    source_ip: &str,
) -> AuditEvent {
    use chrono::TimeZone;
    AuditEvent {
        event_time: Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap(),
        user_id: user_id.to_string(),
        service_name: service_name.to_string(),
        action_name: action_name.to_string(),
        request_params: "{}".to_string(),
        response: r#"{"status": "success"}"#.to_string(),
        session_id: "session-1".to_string(),
        source_ip_address: source_ip.to_string(),
        user_agent: "Databricks/1.0".to_string(),
    }
}
