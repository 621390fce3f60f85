//! Cyber-security agent.
//!
//! Selects sensitive actions and high-risk services, tags each event with
//! risk indicators, and either asks the model for findings or groups the
//! riskiest events itself.

use super::model::{parse_findings, ModelClient, FINDINGS_FORMAT};
use super::network::{classify_connection, ConnectionType};
use super::{describe_window, AgentCapability};
use crate::error::AgentError;
use crate::ingest::{AuditEvent, DatasetRef};
use crate::models::{Category, Finding, RunContext, Severity};
use async_trait::async_trait;
use chrono::Timelike;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, info};

pub const AGENT_NAME: &str = "security";

const SUSPICIOUS_ACTIONS: &[&str] = &[
    "createSecret",
    "getSecret",
    "listSecrets",
    "createCluster",
    "startCluster",
    "deleteCluster",
    "executeQuery",
    "getQueryResult",
    "createJob",
    "runJob",
    "deleteJob",
];
const HIGH_RISK_SERVICES: &[&str] = &["secrets", "workspace", "clusters", "jobs"];
const SENSITIVE_ACTIONS: &[&str] = &["createSecret", "getSecret", "deleteCluster"];
const FAILURE_MARKERS: &[&str] = &["error", "failed", "unauthorized", "forbidden", "denied"];

const MAX_RISK: u8 = 10;
/// Events at or above this risk are reported by the heuristic path.
const REPORT_THRESHOLD: u8 = 5;
const MAX_PROMPT_EVENTS: usize = 200;

const SYSTEM_PROMPT: &str = r#"You are a security analyst reviewing audit logs from a managed data platform.
Identify credential misuse, privilege escalation, failed access attempts, off-hours activity and data exfiltration risks.
Each event carries precomputed indicators and a risk score from 0 to 10; use them as hints, not conclusions."#;

/// Per-event risk indicators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RiskIndicators {
    pub failed_action: bool,
    pub external_user: bool,
    pub unusual_timing: bool,
    pub suspicious_ip: bool,
    pub sensitive_action: bool,
}

impl RiskIndicators {
    /// Weighted sum of the indicators, capped at 10.
    pub fn risk_score(&self) -> u8 {
        let mut risk = 0u8;
        if self.failed_action {
            risk += 3;
        }
        if self.external_user {
            risk += 2;
        }
        if self.unusual_timing {
            risk += 1;
        }
        if self.suspicious_ip {
            risk += 2;
        }
        if self.sensitive_action {
            risk += 2;
        }
        risk.min(MAX_RISK)
    }

    fn labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        if self.failed_action {
            labels.push("failed_action");
        }
        if self.external_user {
            labels.push("external_user");
        }
        if self.unusual_timing {
            labels.push("unusual_timing");
        }
        if self.suspicious_ip {
            labels.push("suspicious_ip");
        }
        if self.sensitive_action {
            labels.push("sensitive_action");
        }
        labels
    }
}

#[derive(Debug, Serialize)]
struct SecurityEvent<'a> {
    #[serde(flatten)]
    event: &'a AuditEvent,
    #[serde(flatten)]
    indicators: RiskIndicators,
    event_risk_score: u8,
}

pub fn is_failed_response(response: &str) -> bool {
    let response = response.to_lowercase();
    FAILURE_MARKERS.iter().any(|marker| response.contains(marker))
}

/// Outside 06:00-22:59 UTC.
pub fn is_unusual_timing(event: &AuditEvent) -> bool {
    let hour = event.event_time.hour();
    !(6..=22).contains(&hour)
}

/// Unroutable or broadcast-range source addresses.
pub fn is_suspicious_ip(ip: &str) -> bool {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => matches!(v4.octets()[0], 0 | 255),
        Ok(IpAddr::V6(v6)) => v6.is_unspecified(),
        Err(_) => false,
    }
}

/// Agent reporting on security threats.
pub struct CyberSecurityAgent {
    model: Option<ModelClient>,
    internal_domains: Vec<String>,
}

impl CyberSecurityAgent {
    pub fn new(model: Option<ModelClient>) -> Self {
        Self {
            model,
            internal_domains: vec!["company.com".to_string(), "internal".to_string()],
        }
    }

    /// Domains whose users count as internal. Empty keeps the defaults.
    pub fn with_internal_domains(mut self, domains: Vec<String>) -> Self {
        if !domains.is_empty() {
            self.internal_domains = domains.into_iter().map(|d| d.to_lowercase()).collect();
        }
        self
    }

    pub fn is_external_user(&self, user_id: &str) -> bool {
        let user = user_id.to_lowercase();
        user.contains('@')
            && !self
                .internal_domains
                .iter()
                .any(|domain| user.contains(domain.as_str()))
    }

    pub fn indicators(&self, event: &AuditEvent) -> RiskIndicators {
        RiskIndicators {
            failed_action: is_failed_response(&event.response),
            external_user: self.is_external_user(&event.user_id),
            unusual_timing: is_unusual_timing(event),
            suspicious_ip: is_suspicious_ip(&event.source_ip_address),
            sensitive_action: SENSITIVE_ACTIONS.contains(&event.action_name.as_str()),
        }
    }

    fn filter_events<'a>(&self, events: &'a [AuditEvent]) -> Vec<SecurityEvent<'a>> {
        events
            .iter()
            .filter(|e| {
                SUSPICIOUS_ACTIONS.contains(&e.action_name.as_str())
                    || HIGH_RISK_SERVICES.contains(&e.service_name.as_str())
            })
            .map(|event| {
                let indicators = self.indicators(event);
                SecurityEvent {
                    event,
                    indicators,
                    event_risk_score: indicators.risk_score(),
                }
            })
            .collect()
    }

    async fn analyze_with_model(
        &self,
        model: &ModelClient,
        events: &[SecurityEvent<'_>],
        context: &RunContext,
    ) -> Result<Vec<Finding>, AgentError> {
        // Riskiest events first so truncation keeps them.
        let mut ranked: Vec<&SecurityEvent<'_>> = events.iter().collect();
        ranked.sort_by(|a, b| b.event_risk_score.cmp(&a.event_risk_score));
        ranked.truncate(MAX_PROMPT_EVENTS);

        let audit_json = serde_json::to_string(&ranked)
            .map_err(|e| AgentError::fatal(format!("failed to encode events: {}", e)))?;

        let mut prompt = String::new();
        prompt.push_str(&format!(
            "Analyze security threats over the last {} ({} of {} events shown).\n\n",
            describe_window(context.window_start, context.window_end),
            ranked.len(),
            events.len()
        ));
        prompt.push_str(FINDINGS_FORMAT);
        prompt.push_str("\n\n=== SECURITY EVENTS ===\n");
        prompt.push_str(&audit_json);
        prompt.push_str("\n=== END OF EVENTS ===\n");

        let response = model.complete(SYSTEM_PROMPT, &prompt).await?;
        Ok(parse_findings(&response, Category::Security))
    }

    /// One finding per (user, action, source IP) among risky events.
    fn analyze_heuristically(&self, events: &[SecurityEvent<'_>]) -> Vec<Finding> {
        let mut groups: BTreeMap<(&str, &str, &str), Vec<&SecurityEvent<'_>>> = BTreeMap::new();
        for e in events
            .iter()
            .filter(|e| e.event_risk_score >= REPORT_THRESHOLD)
        {
            groups
                .entry((
                    e.event.user_id.as_str(),
                    e.event.action_name.as_str(),
                    e.event.source_ip_address.as_str(),
                ))
                .or_default()
                .push(e);
        }

        groups
            .into_iter()
            .filter_map(|((user, action, ip), hits)| {
                let worst = hits.iter().max_by_key(|e| e.event_risk_score)?;
                let risk = worst.event_risk_score;
                let severity = match risk {
                    0..=5 => Severity::Medium,
                    6..=7 => Severity::High,
                    _ => Severity::Critical,
                };

                Some(
                    Finding::new(
                        Category::Security,
                        severity,
                        format!(
                            "{} risky {} call(s) on {} by {} from {} ({})",
                            hits.len(),
                            action,
                            worst.event.service_name,
                            user,
                            ip,
                            worst.indicators.labels().join(", ")
                        ),
                    )
                    .with_evidence("user_id", user)
                    .with_evidence("action_name", action)
                    .with_evidence("service_name", worst.event.service_name.as_str())
                    .with_evidence("source_ip_address", ip)
                    .with_evidence(
                        "connection_type",
                        classify_connection(ip).to_string(),
                    )
                    .with_evidence("event_count", hits.len().to_string())
                    .with_evidence("max_risk_score", risk.to_string())
                    .with_confidence(0.5 + f64::from(risk) / 20.0),
                )
            })
            .collect()
    }
}

#[async_trait]
impl AgentCapability for CyberSecurityAgent {
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
            info!(run_id = %context.run_id, "No security-related events in window");
            return Ok(Vec::new());
        }

        let external = events
            .iter()
            .filter(|e| classify_connection(&e.event.source_ip_address) == ConnectionType::External)
            .count();
        debug!(
            run_id = %context.run_id,
            "Analyzing {} security events ({} from external addresses)",
            events.len(),
            external
        );

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
    use chrono::{Duration, TimeZone, Utc};

    fn context() -> RunContext {
        let end = Utc::now();
        RunContext::new(end - Duration::hours(24), end, None).unwrap()
    }

    #[test]
    fn test_risk_score_weights_and_cap() {
        assert_eq!(RiskIndicators::default().risk_score(), 0);

        let failed = RiskIndicators {
            failed_action: true,
            ..Default::default()
        };
        assert_eq!(failed.risk_score(), 3);

        let everything = RiskIndicators {
            failed_action: true,
            external_user: true,
            unusual_timing: true,
            suspicious_ip: true,
            sensitive_action: true,
        };
        assert_eq!(everything.risk_score(), 10);
    }

    #[test]
    fn test_indicator_helpers() {
        assert!(is_failed_response(r#"{"status": "error", "reason": "Unauthorized"}"#));
        assert!(!is_failed_response(r#"{"status": "success"}"#));

        assert!(is_suspicious_ip("0.1.2.3"));
        assert!(is_suspicious_ip("255.1.2.3"));
        assert!(!is_suspicious_ip("203.0.113.1"));
        assert!(!is_suspicious_ip("not-an-ip"));

        let mut event = audit_event("a@corp.com", "sql", "executeQuery", "10.0.0.1");
        assert!(!is_unusual_timing(&event));
        event.event_time = Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap();
        assert!(is_unusual_timing(&event));
        event.event_time = Utc.with_ymd_and_hms(2026, 3, 2, 22, 30, 0).unwrap();
        assert!(!is_unusual_timing(&event));
    }

    #[test]
    fn test_external_user_uses_internal_domains() {
        let agent = CyberSecurityAgent::new(None);
        assert!(agent.is_external_user("someone@gmail.com"));
        assert!(!agent.is_external_user("dev@company.com"));
        assert!(!agent.is_external_user("service-principal"));

        let agent = agent.with_internal_domains(vec!["Corp.com".to_string()]);
        assert!(!agent.is_external_user("dev@corp.com"));
        assert!(agent.is_external_user("dev@company.com"));
    }

    #[tokio::test]
    async fn test_heuristic_reports_risky_groups() {
        let agent = CyberSecurityAgent::new(None);

        let mut failed_secret = audit_event("x@gmail.com", "secrets", "getSecret", "0.0.0.7");
        failed_secret.response = r#"{"status": "error"}"#.to_string();
        // failed 3 + external 2 + suspicious ip 2 + sensitive 2 = 9

        let external_query = audit_event("y@gmail.com", "sql", "executeQuery", "203.0.113.1");
        // external 2 only: below threshold

        let benign = audit_event("dev@company.com", "notebooks", "runNotebook", "10.0.0.1");

        let dataset = DatasetRef::seal(Dataset {
            audit_events: vec![failed_secret.clone(), failed_secret, external_query, benign],
            ..Default::default()
        });

        let findings = agent.analyze(&dataset, &context()).await.unwrap();
        assert_eq!(findings.len(), 1);

        let finding = &findings[0];
        assert_eq!(finding.category, Category::Security);
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.evidence["max_risk_score"], "9");
        assert_eq!(finding.evidence["event_count"], "2");
        assert_eq!(finding.evidence["service_name"], "secrets");
        assert!((finding.confidence - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_security_events_is_success() {
        let agent = CyberSecurityAgent::new(None);
        let dataset = DatasetRef::seal(Dataset {
            audit_events: vec![audit_event("a@corp.com", "mlflow", "logModel", "10.0.0.1")],
            ..Default::default()
        });
        assert!(agent.analyze(&dataset, &context()).await.unwrap().is_empty());
    }
}
