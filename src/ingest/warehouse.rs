//! System-table ingestion through the SQL statement execution API.
//!
//! Audit logs are required: any failure fetching them fails the ingestion.
//! Cluster and query history are supplementary and degrade to empty tables
//! with a warning.

use super::{AuditEvent, ClusterRecord, Dataset, DatasetRef, Ingestor, QueryRecord};
use crate::error::IngestionError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const AUDIT_TABLE: &str = "system.access.audit";
const CLUSTERS_TABLE: &str = "system.compute.clusters";
const QUERY_HISTORY_TABLE: &str = "system.query.history";

/// Result chunks followed per statement before giving up on the rest.
const MAX_CHUNKS: usize = 1000;

/// Connection settings for the SQL warehouse.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Workspace URL, e.g. `https://adb-123.azuredatabricks.net`.
    pub host: String,
    pub token: String,
    pub warehouse_id: String,
    pub timeout: Duration,
}

/// Ingestor that reads the platform's system tables.
pub struct WarehouseIngestor {
    config: WarehouseConfig,
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    warehouse_id: &'a str,
    statement: &'a str,
    wait_timeout: &'a str,
    on_wait_timeout: &'a str,
    format: &'a str,
    disposition: &'a str,
    parameters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<StatementManifest>,
    #[serde(default)]
    result: Option<StatementResult>,
}

#[derive(Debug, Default, Deserialize)]
struct StatementManifest {
    #[serde(default)]
    total_row_count: Option<u64>,
    /// Set when the warehouse dropped rows beyond its inline result limit.
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    #[serde(default)]
    message: String,
}

/// One chunk of rows; the first arrives inline, the rest by link.
#[derive(Debug, Default, Deserialize)]
struct StatementResult {
    #[serde(default)]
    data_array: Vec<Vec<Option<String>>>,
    #[serde(default)]
    next_chunk_internal_link: Option<String>,
}

type Row = Vec<Option<String>>;

impl WarehouseIngestor {
    pub fn new(config: WarehouseConfig) -> Result<Self, IngestionError> {
        if config.host.is_empty() || config.token.is_empty() || config.warehouse_id.is_empty() {
            return Err(IngestionError::NotConfigured {
                message: "host, token and warehouse id are required".to_string(),
            });
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IngestionError::NotConfigured {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.host.trim_end_matches('/'), path)
    }

    /// Verify credentials before querying.
    async fn check_connection(&self) -> Result<(), IngestionError> {
        let url = self.endpoint("/api/2.0/preview/scim/v2/Me");
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| self.connection_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.connection_error(format!("HTTP {}", response.status())));
        }

        debug!("Connected to workspace {}", self.config.host);
        Ok(())
    }

    fn connection_error(&self, message: String) -> IngestionError {
        IngestionError::Connection {
            endpoint: self.config.host.clone(),
            message,
        }
    }

    async fn execute(
        &self,
        table: &str,
        statement: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Row>, IngestionError> {
        let request = StatementRequest {
            warehouse_id: &self.config.warehouse_id,
            statement,
            wait_timeout: "30s",
            on_wait_timeout: "CANCEL",
            format: "JSON_ARRAY",
            disposition: "INLINE",
            parameters: vec![
                json!({"name": "window_start", "value": window_start.to_rfc3339(), "type": "TIMESTAMP"}),
                json!({"name": "window_end", "value": window_end.to_rfc3339(), "type": "TIMESTAMP"}),
            ],
        };

        let query_error = |message: String| IngestionError::Query {
            table: table.to_string(),
            message,
        };

        let response = self
            .http_client
            .post(self.endpoint("/api/2.0/sql/statements"))
            .bearer_auth(&self.config.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| query_error(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(query_error(format!("HTTP {}: {}", status, body)));
        }

        let parsed: StatementResponse =
            response
                .json()
                .await
                .map_err(|e| IngestionError::Decode {
                    table: table.to_string(),
                    message: e.to_string(),
                })?;

        if parsed.status.state != "SUCCEEDED" {
            let message = parsed
                .status
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| format!("statement ended in state {}", parsed.status.state));
            return Err(query_error(message));
        }

        let mut rows = Vec::new();
        let mut next = append_chunk(&mut rows, parsed.result.unwrap_or_default());
        let mut chunks = 1usize;
        while let Some(link) = next {
            if chunks >= MAX_CHUNKS {
                warn!("Stopped following {} result after {} chunks", table, chunks);
                break;
            }
            let chunk = self.fetch_chunk(table, &link).await?;
            next = append_chunk(&mut rows, chunk);
            chunks += 1;
        }

        let manifest = parsed.manifest.unwrap_or_default();
        if let Some(shortfall) = describe_shortfall(rows.len(), &manifest) {
            warn!("Partial result from {}: {}", table, shortfall);
        }
        debug!("Fetched {} rows in {} chunk(s) from {}", rows.len(), chunks, table);
        Ok(rows)
    }

    async fn fetch_chunk(&self, table: &str, link: &str) -> Result<StatementResult, IngestionError> {
        let query_error = |message: String| IngestionError::Query {
            table: table.to_string(),
            message,
        };

        let response = self
            .http_client
            .get(self.endpoint(link))
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| query_error(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(query_error(format!("chunk {}: HTTP {}: {}", link, status, body)));
        }

        response.json().await.map_err(|e| IngestionError::Decode {
            table: table.to_string(),
            message: format!("chunk {}: {}", link, e),
        })
    }
}

/// Move a chunk's rows into `rows` and return the link to the next chunk.
fn append_chunk(rows: &mut Vec<Row>, chunk: StatementResult) -> Option<String> {
    rows.extend(chunk.data_array);
    chunk.next_chunk_internal_link
}

/// Why `fetched` rows fall short of the full result, if they do.
fn describe_shortfall(fetched: usize, manifest: &StatementManifest) -> Option<String> {
    let total = manifest.total_row_count;
    if manifest.truncated {
        return Some(match total {
            Some(total) => format!("truncated by the warehouse, {} of {} rows", fetched, total),
            None => format!("truncated by the warehouse after {} rows", fetched),
        });
    }
    match total {
        Some(total) if (fetched as u64) < total => {
            Some(format!("{} of {} rows fetched", fetched, total))
        }
        _ => None,
    }
}

#[async_trait]
impl Ingestor for WarehouseIngestor {
    async fn fetch(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<DatasetRef, IngestionError> {
        self.check_connection().await?;

        let audit_sql = format!(
            "SELECT event_time, user_identity.email, service_name, action_name, \
             to_json(request_params), to_json(response), session_id, source_ip_address, user_agent \
             FROM {} WHERE event_time BETWEEN :window_start AND :window_end \
             ORDER BY event_time DESC",
            AUDIT_TABLE
        );
        let audit_rows = self
            .execute(AUDIT_TABLE, &audit_sql, window_start, window_end)
            .await?;
        let audit_events = decode_rows(AUDIT_TABLE, &audit_rows, decode_audit_row)?;

        let clusters_sql = format!(
            "SELECT cluster_id, cluster_name, state, cluster_source, owned_by, \
             create_time, change_time FROM {} \
             WHERE change_time <= :window_end \
             AND (delete_time IS NULL OR delete_time >= :window_start)",
            CLUSTERS_TABLE
        );
        let clusters = match self
            .execute(CLUSTERS_TABLE, &clusters_sql, window_start, window_end)
            .await
            .and_then(|rows| decode_rows(CLUSTERS_TABLE, &rows, decode_cluster_row))
        {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!("Continuing without cluster metrics: {}", e);
                Vec::new()
            }
        };

        let queries_sql = format!(
            "SELECT statement_id, statement_text, executed_by, start_time, total_duration_ms, \
             execution_status, error_message FROM {} \
             WHERE start_time BETWEEN :window_start AND :window_end \
             ORDER BY start_time DESC",
            QUERY_HISTORY_TABLE
        );
        let queries = match self
            .execute(QUERY_HISTORY_TABLE, &queries_sql, window_start, window_end)
            .await
            .and_then(|rows| decode_rows(QUERY_HISTORY_TABLE, &rows, decode_query_row))
        {
            Ok(queries) => queries,
            Err(e) => {
                warn!("Continuing without query history: {}", e);
                Vec::new()
            }
        };

        let dataset = Dataset {
            audit_events,
            clusters,
            queries,
        };
        info!("Ingested {}", dataset.summary());
        Ok(DatasetRef::seal(dataset))
    }
}

fn decode_rows<T>(
    table: &str,
    rows: &[Row],
    decode: fn(&Row) -> Result<T, String>,
) -> Result<Vec<T>, IngestionError> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            decode(row).map_err(|message| IngestionError::Decode {
                table: table.to_string(),
                message: format!("row {}: {}", i, message),
            })
        })
        .collect()
}

fn text(row: &Row, index: usize) -> String {
    row.get(index).cloned().flatten().unwrap_or_default()
}

fn optional_text(row: &Row, index: usize) -> Option<String> {
    row.get(index).cloned().flatten().filter(|s| !s.is_empty())
}

/// Parse the timestamp formats the statement API returns.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{}': {}", value, e))
}

fn optional_timestamp(row: &Row, index: usize) -> Result<Option<DateTime<Utc>>, String> {
    optional_text(row, index)
        .map(|value| parse_timestamp(&value))
        .transpose()
}

fn decode_audit_row(row: &Row) -> Result<AuditEvent, String> {
    Ok(AuditEvent {
        event_time: parse_timestamp(&text(row, 0))?,
        user_id: text(row, 1),
        service_name: text(row, 2),
        action_name: text(row, 3),
        request_params: text(row, 4),
        response: text(row, 5),
        session_id: text(row, 6),
        source_ip_address: text(row, 7),
        user_agent: text(row, 8),
    })
}

fn decode_cluster_row(row: &Row) -> Result<ClusterRecord, String> {
    Ok(ClusterRecord {
        cluster_id: text(row, 0),
        cluster_name: text(row, 1),
        state: text(row, 2),
        cluster_source: text(row, 3),
        creator: text(row, 4),
        start_time: optional_timestamp(row, 5)?,
        last_activity_time: optional_timestamp(row, 6)?,
    })
}

fn decode_query_row(row: &Row) -> Result<QueryRecord, String> {
    let duration = text(row, 4);
    Ok(QueryRecord {
        query_id: text(row, 0),
        query_text: text(row, 1),
        user_id: text(row, 2),
        start_time: parse_timestamp(&text(row, 3))?,
        duration_ms: if duration.is_empty() {
            0
        } else {
            duration
                .parse()
                .map_err(|e| format!("invalid duration '{}': {}", duration, e))?
        },
        status: text(row, 5),
        error_message: optional_text(row, 6),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(values: &[Option<&str>]) -> Row {
        values.iter().map(|v| v.map(String::from)).collect()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 2, 14, 5, 0).unwrap();
        assert_eq!(parse_timestamp("2026-03-02T14:05:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2026-03-02T14:05:00.000Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2026-03-02 14:05:00").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_decode_audit_row() {
        let event = decode_audit_row(&row(&[
            Some("2026-03-02T14:05:00Z"),
            Some("admin@corp.com"),
            Some("secrets"),
            Some("getSecret"),
            Some("{}"),
            None,
            Some("s-1"),
            Some("203.0.113.9"),
            Some("curl/8.0"),
        ]))
        .unwrap();

        assert_eq!(event.user_id, "admin@corp.com");
        assert_eq!(event.action_name, "getSecret");
        assert_eq!(event.response, "");
        assert_eq!(event.source_ip_address, "203.0.113.9");
    }

    #[test]
    fn test_decode_rows_reports_row_index() {
        let rows = vec![
            row(&[Some("q1"), Some("SELECT 1"), Some("u"), Some("2026-03-02T00:00:00Z"), Some("12"), Some("FINISHED"), None]),
            row(&[Some("q2"), Some("SELECT 2"), Some("u"), Some("2026-03-02T00:00:00Z"), Some("fast"), Some("FINISHED"), None]),
        ];

        let err = decode_rows(QUERY_HISTORY_TABLE, &rows, decode_query_row).unwrap_err();
        match err {
            IngestionError::Decode { table, message } => {
                assert_eq!(table, QUERY_HISTORY_TABLE);
                assert!(message.starts_with("row 1"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    fn audit_json_row(user: &str) -> serde_json::Value {
        json!([
            "2026-03-02T14:05:00Z",
            user,
            "secrets",
            "getSecret",
            "{}",
            null,
            "s-1",
            "203.0.113.9",
            "curl/8.0"
        ])
    }

    #[test]
    fn test_chunked_response_rows_are_all_decoded() {
        let first: StatementResponse = serde_json::from_value(json!({
            "statement_id": "01ef",
            "status": {"state": "SUCCEEDED"},
            "manifest": {"total_row_count": 3, "total_chunk_count": 2, "truncated": false},
            "result": {
                "chunk_index": 0,
                "data_array": [audit_json_row("a@corp.com"), audit_json_row("b@corp.com")],
                "next_chunk_index": 1,
                "next_chunk_internal_link": "/api/2.0/sql/statements/01ef/result/chunks/1"
            }
        }))
        .unwrap();
        let second: StatementResult = serde_json::from_value(json!({
            "chunk_index": 1,
            "data_array": [audit_json_row("c@corp.com")]
        }))
        .unwrap();

        let mut rows = Vec::new();
        let next = append_chunk(&mut rows, first.result.unwrap());
        assert_eq!(
            next.as_deref(),
            Some("/api/2.0/sql/statements/01ef/result/chunks/1")
        );
        let manifest = first.manifest.unwrap();
        assert_eq!(
            describe_shortfall(rows.len(), &manifest).as_deref(),
            Some("2 of 3 rows fetched")
        );

        assert_eq!(append_chunk(&mut rows, second), None);
        assert_eq!(describe_shortfall(rows.len(), &manifest), None);

        let events = decode_rows(AUDIT_TABLE, &rows, decode_audit_row).unwrap();
        let users: Vec<&str> = events.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(users, vec!["a@corp.com", "b@corp.com", "c@corp.com"]);
    }

    #[test]
    fn test_truncated_manifest_is_reported() {
        let manifest = StatementManifest {
            total_row_count: Some(250_000),
            truncated: true,
        };
        let shortfall = describe_shortfall(100_000, &manifest).unwrap();
        assert!(shortfall.contains("100000 of 250000"));

        let unknown_total = StatementManifest {
            total_row_count: None,
            truncated: true,
        };
        assert!(describe_shortfall(10, &unknown_total).is_some());
        assert_eq!(describe_shortfall(10, &StatementManifest::default()), None);
    }

    #[test]
    fn test_new_requires_credentials() {
        let result = WarehouseIngestor::new(WarehouseConfig {
            host: "https://example.cloud.databricks.com".to_string(),
            token: String::new(),
            warehouse_id: "wh".to_string(),
            timeout: Duration::from_secs(5),
        });
        assert!(matches!(result, Err(IngestionError::NotConfigured { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let ingestor = WarehouseIngestor::new(WarehouseConfig {
            host: "http://127.0.0.1:9".to_string(),
            token: "token".to_string(),
            warehouse_id: "wh".to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        let end = Utc::now();
        let err = ingestor
            .fetch(end - chrono::Duration::hours(1), end)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Connection { .. }));
    }
}
