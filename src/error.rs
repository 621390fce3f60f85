//! Error taxonomy for the orchestration pipeline.
//!
//! Each collaborator boundary has its own error type so the orchestrator can
//! decide, by type alone, whether a failure aborts the run, is retried, or is
//! merely logged.

use serde::{Deserialize, Serialize};

/// Failure while resolving the dataset for a run. Always fatal to the run.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestionError {
    #[error("cannot connect to source platform at {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("query against {table} failed: {message}")]
    Query { table: String, message: String },

    #[error("failed to decode {table} rows: {message}")]
    Decode { table: String, message: String },

    #[error("ingestion is not configured: {message}")]
    NotConfigured { message: String },
}

/// Failure reported by (or imposed on) an agent capability.
///
/// `Transient` is the only kind the scheduler retries on its own; `Timeout`
/// is retried by the scheduler's attempt loop and never produced by agents.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentError {
    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("fatal failure: {message}")]
    Fatal { message: String },

    #[error("timed out after {limit_ms} ms")]
    Timeout { limit_ms: u64 },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

impl AgentError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the scheduler may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// Failure handing a finished run to the reporting collaborator. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("report rejected: {0}")]
    Rejected(String),
}

/// Failure persisting a run to the tracking store. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("tracking store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize tracking record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure while scoring a run. Degrades the run to "unscored".
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("score weights must be non-negative and not all zero ({detail})")]
    InvalidWeights { detail: String },

    #[error("non-finite score computed for {subject}")]
    NonFinite { subject: String },
}

/// Programmer-error class failures. These abort the run loudly.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("run window is empty or inverted: {start} >= {end}")]
    InvalidWindow { start: String, end: String },

    #[error("aggregation requires at least one agent outcome")]
    NoOutcomes,

    #[error("agent {agent} produced more than one outcome")]
    DuplicateAgent { agent: String },

    #[error("outcome for agent {agent} is inconsistent: {detail}")]
    InconsistentOutcome { agent: String, detail: String },

    #[error("run context has no dataset bound")]
    UnboundDataset,
}

/// Errors that escape [`crate::orchestrator::Orchestrator::run_once`].
///
/// Operational failures (ingestion, agents, delivery) never show up here;
/// they are recorded on the run itself.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(AgentError::transient("503").is_retryable());
        assert!(AgentError::Timeout { limit_ms: 10 }.is_retryable());
        assert!(!AgentError::fatal("bad request").is_retryable());
        assert!(!AgentError::Cancelled {
            reason: "shutdown".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_agent_error_serializes_with_kind_tag() {
        let json = serde_json::to_string(&AgentError::fatal("boom")).unwrap();
        assert_eq!(json, r#"{"kind":"fatal","message":"boom"}"#);
    }

    #[test]
    fn test_invariant_converts_into_orchestrator_error() {
        let err: OrchestratorError = InvariantViolation::NoOutcomes.into();
        assert!(err.to_string().contains("at least one agent outcome"));
    }
}
