//! Network analysis agent.
//!
//! Looks at data-plane actions (queries, cluster and job control) and where
//! they were issued from. With a model configured the filtered events are
//! sent for analysis; otherwise external-origin access is reported directly.

use super::model::{parse_findings, ModelClient, FINDINGS_FORMAT};
use super::{describe_window, AgentCapability};
use crate::error::AgentError;
use crate::ingest::{AuditEvent, DatasetRef};
use crate::models::{Category, Finding, RunContext, Severity};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, info};

pub const AGENT_NAME: &str = "network";

const NETWORK_SERVICES: &[&str] = &["sql", "clusters", "jobs", "dbfs", "workspace", "secrets"];
const NETWORK_ACTIONS: &[&str] = &[
    "executeQuery",
    "getQueryResult",
    "createCluster",
    "startCluster",
    "terminateCluster",
    "runJob",
    "submitRun",
    "getRun",
    "listRuns",
];

/// Events sent to the model per request.
const MAX_PROMPT_EVENTS: usize = 200;

const SYSTEM_PROMPT: &str = r#"You are a network security analyst reviewing audit logs from a managed data platform.
Identify unusual access patterns, external connections, traffic spikes and misconfigurations.
Every finding must cite the source IP, user, action and service it is based on."#;

/// Where a request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Internal,
    External,
    Unknown,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Internal => write!(f, "internal"),
            ConnectionType::External => write!(f, "external"),
            ConnectionType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify an address as internal (private, loopback, link-local) or external.
pub fn classify_connection(ip: &str) -> ConnectionType {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            if v4.is_private() || v4.is_loopback() || v4.is_link_local() {
                ConnectionType::Internal
            } else {
                ConnectionType::External
            }
        }
        Ok(IpAddr::V6(v6)) => {
            let first = v6.segments()[0];
            let unique_local = first & 0xfe00 == 0xfc00;
            let link_local = first & 0xffc0 == 0xfe80;
            if v6.is_loopback() || unique_local || link_local {
                ConnectionType::Internal
            } else {
                ConnectionType::External
            }
        }
        Err(_) => ConnectionType::Unknown,
    }
}

#[derive(Debug, Serialize)]
struct NetworkEvent<'a> {
    #[serde(flatten)]
    event: &'a AuditEvent,
    connection_type: ConnectionType,
}

/// Agent reporting on network access patterns.
pub struct NetworkAnalysisAgent {
    model: Option<ModelClient>,
}

impl NetworkAnalysisAgent {
    pub fn new(model: Option<ModelClient>) -> Self {
        Self { model }
    }

    fn filter_events<'a>(&self, events: &'a [AuditEvent]) -> Vec<NetworkEvent<'a>> {
        events
            .iter()
            .filter(|e| {
                NETWORK_SERVICES.contains(&e.service_name.as_str())
                    && NETWORK_ACTIONS.contains(&e.action_name.as_str())
            })
            .map(|event| NetworkEvent {
                event,
                connection_type: classify_connection(&event.source_ip_address),
            })
            .collect()
    }

    async fn analyze_with_model(
        &self,
        model: &ModelClient,
        events: &[NetworkEvent<'_>],
        context: &RunContext,
    ) -> Result<Vec<Finding>, AgentError> {
        let sample = &events[..events.len().min(MAX_PROMPT_EVENTS)];
        let audit_json = serde_json::to_string(sample)
            .map_err(|e| AgentError::fatal(format!("failed to encode events: {}", e)))?;

        let mut prompt = String::new();
        prompt.push_str(&format!(
            "Analyze network activity over the last {} ({} of {} events shown).\n\n",
            describe_window(context.window_start, context.window_end),
            sample.len(),
            events.len()
        ));
        prompt.push_str(FINDINGS_FORMAT);
        prompt.push_str("\n\n=== AUDIT EVENTS ===\n");
        prompt.push_str(&audit_json);
        prompt.push_str("\n=== END OF EVENTS ===\n");

        let response = model.complete(SYSTEM_PROMPT, &prompt).await?;
        Ok(parse_findings(&response, Category::Network))
    }

    /// One finding per (external IP, user) pair.
    fn analyze_heuristically(&self, events: &[NetworkEvent<'_>]) -> Vec<Finding> {
        let mut groups: BTreeMap<(&str, &str), Vec<&AuditEvent>> = BTreeMap::new();
        for e in events
            .iter()
            .filter(|e| e.connection_type == ConnectionType::External)
        {
            groups
                .entry((
                    e.event.source_ip_address.as_str(),
                    e.event.user_id.as_str(),
                ))
                .or_default()
                .push(e.event);
        }

        groups
            .into_iter()
            .map(|((ip, user), hits)| {
                let services: BTreeSet<&str> =
                    hits.iter().map(|e| e.service_name.as_str()).collect();
                let count = hits.len();
                let severity = match count {
                    0..=2 => Severity::Low,
                    3..=9 => Severity::Medium,
                    _ => Severity::High,
                };

                Finding::new(
                    Category::Network,
                    severity,
                    format!(
                        "{} request(s) from external address {} by {}",
                        count, ip, user
                    ),
                )
                .with_evidence("source_ip_address", ip)
                .with_evidence("user_id", user)
                .with_evidence("connection_type", ConnectionType::External.to_string())
                .with_evidence("event_count", count.to_string())
                .with_evidence(
                    "services",
                    services.into_iter().collect::<Vec<_>>().join(","),
                )
                .with_confidence(0.6 + 0.05 * count.min(8) as f64)
            })
            .collect()
    }
}

#[async_trait]
impl AgentCapability for NetworkAnalysisAgent {
    fn name(&self) -> &str {
        AGENT_NAME
    }

    async fn analyze(
        &self,
        dataset: &DatasetRef,
        context: &RunContext,
    ) -> Result<Vec<Finding>, AgentError> {
        let events = self.filter_events(&dataset.snapshot().audit_events);
        if events.is_empty() {
            info!(run_id = %context.run_id, "No network-related events in window");
            return Ok(Vec::new());
        }
        debug!(run_id = %context.run_id, "Analyzing {} network events", events.len());

        match self.model {
            Some(ref model) => self.analyze_with_model(model, &events, context).await,
            None => Ok(self.analyze_heuristically(&events)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{audit_event, Dataset};
    use chrono::{Duration, Utc};

    fn context() -> RunContext {
        let end = Utc::now();
        RunContext::new(end - Duration::hours(24), end, None).unwrap()
    }

    #[test]
    fn test_classify_connection() {
        assert_eq!(classify_connection("10.0.0.1"), ConnectionType::Internal);
        assert_eq!(classify_connection("172.16.0.1"), ConnectionType::Internal);
        assert_eq!(classify_connection("172.32.0.1"), ConnectionType::External);
        assert_eq!(classify_connection("192.168.1.1"), ConnectionType::Internal);
        assert_eq!(classify_connection("127.0.0.1"), ConnectionType::Internal);
        assert_eq!(classify_connection("169.254.3.4"), ConnectionType::Internal);
        assert_eq!(classify_connection("203.0.113.1"), ConnectionType::External);
        assert_eq!(classify_connection("fd00::1"), ConnectionType::Internal);
        assert_eq!(classify_connection("2001:db8::1"), ConnectionType::External);
        assert_eq!(classify_connection(""), ConnectionType::Unknown);
    }

    #[tokio::test]
    async fn test_empty_input_is_success_with_no_findings() {
        let agent = NetworkAnalysisAgent::new(None);
        let dataset = DatasetRef::seal(Dataset::default());
        let findings = agent.analyze(&dataset, &context()).await.unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn test_heuristic_groups_external_access() {
        let agent = NetworkAnalysisAgent::new(None);
        let dataset = DatasetRef::seal(Dataset {
            audit_events: vec![
                audit_event("a@corp.com", "sql", "executeQuery", "203.0.113.1"),
                audit_event("a@corp.com", "clusters", "startCluster", "203.0.113.1"),
                audit_event("a@corp.com", "sql", "executeQuery", "10.0.0.1"),
                audit_event("b@corp.com", "jobs", "runJob", "198.51.100.7"),
                // Not a network action.
                audit_event("c@corp.com", "secrets", "getSecret", "203.0.113.1"),
            ],
            ..Default::default()
        });

        let findings = agent.analyze(&dataset, &context()).await.unwrap();
        assert_eq!(findings.len(), 2);

        let first = &findings[0];
        assert_eq!(first.category, Category::Network);
        assert_eq!(first.evidence["source_ip_address"], "198.51.100.7");
        assert_eq!(first.evidence["event_count"], "1");

        let second = &findings[1];
        assert_eq!(second.evidence["source_ip_address"], "203.0.113.1");
        assert_eq!(second.evidence["user_id"], "a@corp.com");
        assert_eq!(second.evidence["services"], "clusters,sql");
        assert_eq!(second.severity, Severity::Low);
        assert!((second.confidence - 0.7).abs() < 1e-9);
    }
}
