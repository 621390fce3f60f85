//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation. Values left unset fall back to the
//! configuration file, then to built-in defaults.

use crate::config::RunMode;
use crate::models::Severity;
use crate::report::ReportFormat;
use clap::Parser;
use std::path::PathBuf;

/// insight-agent - multi-agent security and network insights for platform telemetry
///
/// Pulls audit, cluster and query telemetry for a time window, runs the
/// network and security agents over it, merges and scores their findings,
/// and writes a Markdown or JSON report per run.
///
/// Examples:
///   insight-agent --mock
///   insight-agent --hours 6 --format json --output-dir ./reports
///   insight-agent --mode scheduled --interval 30
///   insight-agent --dry-run
///   insight-agent --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for .insight-agent.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Agents to run, in order (comma-separated)
    ///
    /// Example: --agents network,security
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    pub agents: Option<Vec<String>>,

    /// Length of the analysis window in hours
    #[arg(long, value_name = "HOURS")]
    pub hours: Option<u64>,

    /// Run once, or repeatedly on an interval
    #[arg(long, value_name = "MODE")]
    pub mode: Option<RunMode>,

    /// Minutes between runs in scheduled mode
    #[arg(long, value_name = "MINUTES")]
    pub interval: Option<u64>,

    /// Directory receiving the reports
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Report format (markdown, json)
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<ReportFormat>,

    /// Use synthetic telemetry instead of querying the platform
    #[arg(long)]
    pub mock: bool,

    /// Maximum number of agents running at once
    #[arg(long, value_name = "NUM")]
    pub max_concurrency: Option<usize>,

    /// Per-attempt agent timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Attempts per agent, including the first
    #[arg(long, value_name = "NUM")]
    pub max_attempts: Option<u32>,

    /// Correlation id attached to the run (defaults to the run id)
    #[arg(long, value_name = "ID", env = "INSIGHT_CORRELATION_ID")]
    pub correlation_id: Option<String>,

    /// Fail if findings at or above this severity are found
    ///
    /// Useful for CI pipelines. Exit code 2 when threshold is exceeded.
    /// Values: critical, high, medium, low
    #[arg(long, value_name = "LEVEL")]
    pub fail_on: Option<FailOnLevel>,

    /// Do not write runs to the tracking store
    #[arg(long)]
    pub no_tracking: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: ingest the window and print a summary without running agents
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .insight-agent.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Severity level for --fail-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum FailOnLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl From<FailOnLevel> for Severity {
    fn from(level: FailOnLevel) -> Self {
        match level {
            FailOnLevel::Low => Severity::Low,
            FailOnLevel::Medium => Severity::Medium,
            FailOnLevel::High => Severity::High,
            FailOnLevel::Critical => Severity::Critical,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.hours == Some(0) {
            return Err("Window must be at least 1 hour".to_string());
        }
        if self.interval == Some(0) {
            return Err("Interval must be at least 1 minute".to_string());
        }
        if self.max_concurrency == Some(0) {
            return Err("Max concurrency must be at least 1".to_string());
        }
        if self.max_attempts == Some(0) {
            return Err("Max attempts must be at least 1".to_string());
        }
        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        if let Some(ref agents) = self.agents {
            if agents.iter().any(|a| a.trim().is_empty()) {
                return Err("Agent names must not be empty".to_string());
            }
        }

        if self.dry_run && self.mode == Some(RunMode::Scheduled) {
            return Err("--dry-run cannot be combined with --mode scheduled".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args::parse_from(["insight-agent"])
    }

    #[test]
    fn test_defaults_leave_config_in_charge() {
        let args = make_args();
        assert!(args.hours.is_none());
        assert!(args.mode.is_none());
        assert!(args.format.is_none());
        assert!(!args.mock);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from([
            "insight-agent",
            "--agents",
            "security,network",
            "--mode",
            "scheduled",
            "--interval",
            "15",
            "--fail-on",
            "high",
        ]);
        assert_eq!(
            args.agents,
            Some(vec!["security".to_string(), "network".to_string()])
        );
        assert_eq!(args.mode, Some(RunMode::Scheduled));
        assert_eq!(args.interval, Some(15));
        assert_eq!(args.fail_on, Some(FailOnLevel::High));
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.dry_run = true;
        args.mode = Some(RunMode::Scheduled);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_zero_values() {
        let mut args = make_args();
        args.max_attempts = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.timeout = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.hours = Some(0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_fail_on_maps_to_severity() {
        assert_eq!(Severity::from(FailOnLevel::Low), Severity::Low);
        assert_eq!(Severity::from(FailOnLevel::Critical), Severity::Critical);
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
