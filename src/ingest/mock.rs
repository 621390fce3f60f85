//! Synthetic telemetry for running without platform credentials.
//!
//! Data is derived from a SHA-256 stream seeded with the window bounds, so
//! the same window always produces the same dataset (and dataset digest).

use super::{AuditEvent, ClusterRecord, Dataset, DatasetRef, Ingestor, QueryRecord};
use crate::error::IngestionError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::info;

const SERVICES: &[&str] = &["sql", "clusters", "jobs", "dbfs", "secrets", "mlflow", "notebooks"];
const ACTIONS: &[&str] = &[
    "executeQuery",
    "startCluster",
    "runJob",
    "createSecret",
    "getSecret",
    "logModel",
    "runNotebook",
];
const USERS: &[&str] = &[
    "user1@databricks.com",
    "user2@databricks.com",
    "admin@databricks.com",
];
const SOURCE_IPS: &[&str] = &[
    "192.168.1.1",
    "10.0.0.1",
    "203.0.113.1",
    "127.0.0.1",
    "172.16.0.1",
];
const RESPONSES: &[&str] = &[
    r#"{"status": "success"}"#,
    r#"{"status": "success"}"#,
    r#"{"status": "success"}"#,
    r#"{"status": "error", "reason": "unauthorized"}"#,
];
const CLUSTER_STATES: &[&str] = &["RUNNING", "PENDING", "TERMINATING"];
const CLUSTER_SOURCES: &[&str] = &["UI", "JOB", "API"];
const CLUSTER_NAMES: &[&str] = &["cluster-1", "cluster-2", "ml-cluster", "job-cluster-1"];
const QUERY_STATUSES: &[&str] = &["FINISHED", "RUNNING", "FAILED", "CANCELED"];
const QUERY_TEXTS: &[&str] = &[
    "SELECT * FROM table1",
    "INSERT INTO table2 VALUES (1, 'test')",
    "UPDATE table3 SET col1 = 'value'",
    "DELETE FROM table4 WHERE id = 1",
];

/// Ingestor producing reproducible synthetic data.
#[derive(Debug, Clone, Default)]
pub struct MockIngestor;

impl MockIngestor {
    pub fn new() -> Self {
        Self
    }

    /// Build the dataset for a window without sealing it.
    pub fn generate(&self, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Dataset {
        let mut stream = DigestStream::new(window_start, window_end);
        let span_secs = (window_end - window_start).num_seconds().max(1) as u64;

        let audit_count = stream.range(50, 200);
        let mut audit_events: Vec<AuditEvent> = (0..audit_count)
            .map(|_| AuditEvent {
                event_time: window_start + Duration::seconds(stream.below(span_secs) as i64),
                user_id: stream.pick(USERS).to_string(),
                service_name: stream.pick(SERVICES).to_string(),
                action_name: stream.pick(ACTIONS).to_string(),
                request_params: r#"{"param1": "value1"}"#.to_string(),
                response: stream.pick(RESPONSES).to_string(),
                session_id: stream.token(),
                source_ip_address: stream.pick(SOURCE_IPS).to_string(),
                user_agent: "Databricks/1.0".to_string(),
            })
            .collect();
        audit_events.sort_by(|a, b| b.event_time.cmp(&a.event_time));

        let cluster_count = stream.range(2, 5);
        let clusters = (0..cluster_count)
            .map(|i| {
                let started = window_end - Duration::hours(stream.range(1, 24) as i64);
                ClusterRecord {
                    cluster_id: format!("cluster-{:03}", i + 1),
                    cluster_name: stream.pick(CLUSTER_NAMES).to_string(),
                    state: stream.pick(CLUSTER_STATES).to_string(),
                    cluster_source: stream.pick(CLUSTER_SOURCES).to_string(),
                    creator: stream.pick(USERS).to_string(),
                    start_time: Some(started),
                    last_activity_time: Some(
                        started + Duration::minutes(stream.below(60) as i64),
                    ),
                }
            })
            .collect();

        let query_count = stream.range(20, 100);
        let mut queries: Vec<QueryRecord> = (0..query_count)
            .map(|_| {
                let status = stream.pick(QUERY_STATUSES);
                QueryRecord {
                    query_id: stream.token(),
                    query_text: stream.pick(QUERY_TEXTS).to_string(),
                    user_id: stream.pick(USERS).to_string(),
                    start_time: window_start + Duration::seconds(stream.below(span_secs) as i64),
                    duration_ms: stream.range(100, 10_000),
                    status: status.to_string(),
                    error_message: (status == "FAILED").then(|| "Query failed".to_string()),
                }
            })
            .collect();
        queries.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        Dataset {
            audit_events,
            clusters,
            queries,
        }
    }
}

#[async_trait]
impl Ingestor for MockIngestor {
    async fn fetch(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<DatasetRef, IngestionError> {
        let dataset = self.generate(window_start, window_end);
        info!("Generated mock dataset: {}", dataset.summary());
        Ok(DatasetRef::seal(dataset))
    }
}

/// Deterministic pseudo-random stream: SHA-256 over (seed, counter).
struct DigestStream {
    seed: [u8; 32],
    counter: u64,
}

impl DigestStream {
    fn new(window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(window_start.timestamp().to_be_bytes());
        hasher.update(window_end.timestamp().to_be_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&hasher.finalize());
        Self { seed, counter: 0 }
    }

    fn next_u64(&mut self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(self.counter.to_be_bytes());
        self.counter += 1;
        let block = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&block[..8]);
        u64::from_be_bytes(bytes)
    }

    /// Uniform-ish value in `0..bound` (bound must be > 0).
    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound.max(1)
    }

    /// Value in `low..=high`.
    fn range(&mut self, low: u64, high: u64) -> u64 {
        low + self.below(high - low + 1)
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        items[self.below(items.len() as u64) as usize]
    }

    fn token(&mut self) -> String {
        format!("{:016x}{:016x}", self.next_u64(), self.next_u64())
    }
}
