//! Reporting collaborator.
//!
//! A [`Reporter`] receives every finished run together with its evaluation.
//! Delivery failures are reported back to the orchestrator, which logs them;
//! they never undo the run.

pub mod generator;

use crate::error::DeliveryError;
use crate::models::{EvaluationRecord, RunResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

pub use generator::{generate_json_report, generate_markdown_report};

/// Report file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Markdown,
    Json,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Markdown => "md",
            ReportFormat::Json => "json",
        }
    }
}

/// Where a delivered report ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub location: String,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn deliver(
        &self,
        result: &RunResult,
        evaluation: &EvaluationRecord,
    ) -> Result<Acknowledgement, DeliveryError>;
}

/// Writes one report file per run into a directory.
#[derive(Debug, Clone)]
pub struct FileReporter {
    output_dir: PathBuf,
    format: ReportFormat,
}

impl FileReporter {
    pub fn new(output_dir: impl Into<PathBuf>, format: ReportFormat) -> Self {
        Self {
            output_dir: output_dir.into(),
            format,
        }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.output_dir
            .join(format!("report_{}.{}", run_id, self.format.extension()))
    }
}

#[async_trait]
impl Reporter for FileReporter {
    async fn deliver(
        &self,
        result: &RunResult,
        evaluation: &EvaluationRecord,
    ) -> Result<Acknowledgement, DeliveryError> {
        let content = match self.format {
            ReportFormat::Markdown => generate_markdown_report(result, evaluation),
            ReportFormat::Json => generate_json_report(result, evaluation)?,
        };

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.path_for(&result.run_id);
        tokio::fs::write(&path, content).await?;

        info!(run_id = %result.run_id, "Report written to {}", path.display());
        Ok(Acknowledgement {
            location: path.display().to_string(),
        })
    }
}
