//! Analysis agents.
//!
//! An agent is a pluggable unit of analysis: it receives the ingested
//! dataset for one window and returns findings, or fails with an
//! [`AgentError`] whose kind tells the scheduler whether to retry.

pub mod model;
pub mod network;
pub mod security;

use crate::error::AgentError;
use crate::ingest::DatasetRef;
use crate::models::{Finding, RunContext};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use model::{ModelClient, ModelConfig};
pub use network::NetworkAnalysisAgent;
pub use security::CyberSecurityAgent;

/// Names accepted in `general.agents`.
pub const KNOWN_AGENTS: &[&str] = &[network::AGENT_NAME, security::AGENT_NAME];

/// The capability every analysis agent implements.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    /// Stable name, unique within a registry.
    fn name(&self) -> &str;

    async fn analyze(
        &self,
        dataset: &DatasetRef,
        context: &RunContext,
    ) -> Result<Vec<Finding>, AgentError>;
}

/// Build the agent registry in the order the names are given.
pub fn build_registry(
    names: &[String],
    model: Option<ModelClient>,
    internal_domains: &[String],
) -> Result<Vec<Arc<dyn AgentCapability>>> {
    let mut registry: Vec<Arc<dyn AgentCapability>> = Vec::with_capacity(names.len());

    for name in names {
        if registry.iter().any(|agent| agent.name() == name) {
            bail!("Agent '{}' is registered more than once", name);
        }
        let agent: Arc<dyn AgentCapability> = match name.as_str() {
            network::AGENT_NAME => Arc::new(NetworkAnalysisAgent::new(model.clone())),
            security::AGENT_NAME => Arc::new(
                CyberSecurityAgent::new(model.clone())
                    .with_internal_domains(internal_domains.to_vec()),
            ),
            other => bail!(
                "Unknown agent '{}'. Known agents: {}",
                other,
                KNOWN_AGENTS.join(", ")
            ),
        };
        registry.push(agent);
    }

    if registry.is_empty() {
        bail!("At least one agent must be enabled");
    }
    Ok(registry)
}

/// Human-readable span of a window, e.g. `24.0 hours`.
pub(crate) fn describe_window(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!("{:.1} hours", (end - start).num_seconds() as f64 / 3600.0)
}
