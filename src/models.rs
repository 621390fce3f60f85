//! Data models for the insight pipeline.
//!
//! This module contains the records that flow between pipeline stages:
//! findings produced by agents, per-agent outcomes, the aggregated run
//! result, and the evaluation record.

use crate::error::{AgentError, InvariantViolation};
use crate::ingest::DatasetRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Severity level of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational observation, no action required
    Info,
    /// Low severity - minor hygiene issue
    Low,
    /// Medium severity - worth monitoring
    Medium,
    /// High severity - likely misuse or exposure
    High,
    /// Critical severity - active threat, act now
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "Info"),
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

impl Severity {
    /// Returns an emoji representation of the severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Info => "🔵",
            Severity::Low => "🟢",
            Severity::Medium => "🟡",
            Severity::High => "🟠",
            Severity::Critical => "🔴",
        }
    }

    /// Lenient parse of model output; unknown values map to `Medium`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "info" | "informational" => Severity::Info,
            "low" => Severity::Low,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

/// Category of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Network,
    Security,
    Operational,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Network => write!(f, "Network"),
            Category::Security => write!(f, "Security"),
            Category::Operational => write!(f, "Operational"),
        }
    }
}

impl Category {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "network" => Some(Category::Network),
            "security" => Some(Category::Security),
            "operational" | "operations" => Some(Category::Operational),
            _ => None,
        }
    }
}

/// A single discrete observation produced by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    pub severity: Severity,
    pub description: String,
    /// Supporting field → value pairs (ordered for stable output).
    pub evidence: BTreeMap<String, String>,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

impl Finding {
    pub fn new(category: Category, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            description: description.into(),
            evidence: BTreeMap::new(),
            confidence: 0.5,
        }
    }

    pub fn with_evidence(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.evidence.insert(key.into(), value.into());
        self
    }

    /// Set confidence, clamped into `[0.0, 1.0]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

/// Immutable parameters of one orchestration cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub correlation_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Bound once ingestion resolves; `None` only before `Ingesting` completes.
    pub dataset_ref: Option<DatasetRef>,
}

impl RunContext {
    /// Create a context with a fresh run id.
    pub fn new(
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        correlation_id: Option<String>,
    ) -> Result<Self, InvariantViolation> {
        if window_start >= window_end {
            return Err(InvariantViolation::InvalidWindow {
                start: window_start.to_rfc3339(),
                end: window_end.to_rfc3339(),
            });
        }

        let run_id = Uuid::new_v4().to_string();
        Ok(Self {
            correlation_id: correlation_id.unwrap_or_else(|| run_id.clone()),
            run_id,
            window_start,
            window_end,
            dataset_ref: None,
        })
    }

    /// Consume the context and return one bound to the ingested dataset.
    pub fn bind_dataset(self, dataset_ref: DatasetRef) -> Self {
        Self {
            dataset_ref: Some(dataset_ref),
            ..self
        }
    }

    /// Short form of the run id for log lines and file names.
    pub fn short_id(&self) -> &str {
        &self.run_id[..8.min(self.run_id.len())]
    }
}

/// Terminal status of one agent within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Never ran to completion because the run was cancelled.
    Skipped,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Succeeded => write!(f, "Succeeded"),
            AgentStatus::Failed => write!(f, "Failed"),
            AgentStatus::TimedOut => write!(f, "Timed out"),
            AgentStatus::Skipped => write!(f, "Skipped"),
        }
    }
}

/// What happened to one agent in one run. Finalized by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent_name: String,
    pub status: AgentStatus,
    /// Empty unless `status == Succeeded`.
    pub findings: Vec<Finding>,
    /// Present iff `status != Succeeded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
    pub duration: Duration,
    pub attempt_count: u32,
}

impl AgentOutcome {
    pub fn succeeded(
        agent_name: impl Into<String>,
        findings: Vec<Finding>,
        duration: Duration,
        attempt_count: u32,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: AgentStatus::Succeeded,
            findings,
            error: None,
            duration,
            attempt_count,
        }
    }

    pub fn failed(
        agent_name: impl Into<String>,
        error: AgentError,
        duration: Duration,
        attempt_count: u32,
    ) -> Self {
        Self::unsuccessful(agent_name, AgentStatus::Failed, error, duration, attempt_count)
    }

    pub fn timed_out(
        agent_name: impl Into<String>,
        limit: Duration,
        duration: Duration,
        attempt_count: u32,
    ) -> Self {
        let error = AgentError::Timeout {
            limit_ms: limit.as_millis() as u64,
        };
        Self::unsuccessful(agent_name, AgentStatus::TimedOut, error, duration, attempt_count)
    }

    pub fn skipped(
        agent_name: impl Into<String>,
        reason: impl Into<String>,
        duration: Duration,
        attempt_count: u32,
    ) -> Self {
        let error = AgentError::Cancelled {
            reason: reason.into(),
        };
        Self::unsuccessful(agent_name, AgentStatus::Skipped, error, duration, attempt_count)
    }

    fn unsuccessful(
        agent_name: impl Into<String>,
        status: AgentStatus,
        error: AgentError,
        duration: Duration,
        attempt_count: u32,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            status,
            findings: Vec::new(),
            error: Some(error),
            duration,
            attempt_count,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Succeeded
    }
}

/// Run-level status derived from agent outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    PartialFailure,
    Failed,
}

impl RunStatus {
    /// `Complete` iff all succeeded, `Failed` iff none did, otherwise
    /// `PartialFailure`. `None` for an empty outcome list.
    pub fn from_outcomes(outcomes: &[AgentOutcome]) -> Option<Self> {
        if outcomes.is_empty() {
            return None;
        }
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        Some(if succeeded == outcomes.len() {
            RunStatus::Complete
        } else if succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartialFailure
        })
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Complete => write!(f, "Complete"),
            RunStatus::PartialFailure => write!(f, "PartialFailure"),
            RunStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Stable identifier of a finding within a run: `<agent>#<index>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FindingId(pub String);

impl FindingId {
    pub fn new(agent_name: &str, index: usize) -> Self {
        FindingId(format!("{}#{}", agent_name, index))
    }
}

impl fmt::Display for FindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A finding as it appears in the merged view, with dedup annotations.
///
/// The wrapped [`Finding`] is exactly what the agent produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedFinding {
    pub id: FindingId,
    pub source_agent: String,
    pub finding: Finding,
    /// Lower-confidence duplicates folded into this finding.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deduplicated_from: Vec<FindingId>,
    /// Set on superseded findings: the active finding that replaced them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<FindingId>,
    /// A matching finding was reported by an earlier run.
    #[serde(default)]
    pub recurring: bool,
}

/// The aggregated record for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub correlation_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// In agent registration order.
    pub outcomes: Vec<AgentOutcome>,
    /// Active (deduplicated) findings.
    pub findings: Vec<MergedFinding>,
    /// Duplicates that lost to a higher-confidence finding.
    pub superseded: Vec<MergedFinding>,
    pub run_status: RunStatus,
    /// Highest severity among active findings.
    pub threat_level: Severity,
    pub recommendations: Vec<String>,
}

impl RunResult {
    /// Look up any finding, active or superseded, by id.
    pub fn finding(&self, id: &FindingId) -> Option<&MergedFinding> {
        self.findings
            .iter()
            .chain(self.superseded.iter())
            .find(|f| &f.id == id)
    }

    pub fn failed_outcomes(&self) -> impl Iterator<Item = &AgentOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn outcome(&self, agent_name: &str) -> Option<&AgentOutcome> {
        self.outcomes.iter().find(|o| o.agent_name == agent_name)
    }
}

/// Score breakdown for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentScore {
    /// `None` when the agent did not succeed.
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_term: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_term: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completeness_term: Option<f64>,
}

impl AgentScore {
    pub fn unscored() -> Self {
        Self {
            score: None,
            confidence_term: None,
            latency_term: None,
            completeness_term: None,
        }
    }
}

/// Whether the run received a numeric aggregate score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScoreState {
    Scored,
    Unscored { reason: String },
}

/// Quality scores for a finalized run. One per [`RunResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub run_id: String,
    pub agent_scores: BTreeMap<String, AgentScore>,
    /// Undefined (not zero) when the run is unscored.
    pub aggregate_score: Option<f64>,
    pub state: ScoreState,
    pub generated_at: DateTime<Utc>,
}

impl EvaluationRecord {
    /// Record for a run that could not be scored.
    pub fn unscored(run_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            agent_scores: BTreeMap::new(),
            aggregate_score: None,
            state: ScoreState::Unscored {
                reason: reason.into(),
            },
            generated_at: Utc::now(),
        }
    }

    pub fn is_scored(&self) -> bool {
        self.state == ScoreState::Scored
    }
}
