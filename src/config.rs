//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.insight-agent.toml` files, and turning the result into the immutable
//! runtime wiring used by the orchestrator. Secrets are only ever read from
//! the environment.

use crate::agent::{self, ModelClient, ModelConfig as ModelClientConfig};
use crate::analysis::{DedupPolicy, EvaluationPolicy};
use crate::ingest::{Ingestor, MockIngestor, WarehouseConfig, WarehouseIngestor};
use crate::orchestrator::RuntimeConfig;
use crate::report::ReportFormat;
use crate::scheduler::{RetryBackoff, SchedulingPolicy};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".insight-agent.toml";

/// Environment variable holding the platform access token.
pub const PLATFORM_TOKEN_ENV: &str = "DATABRICKS_TOKEN";

/// Environment variable holding the model-serving token.
pub const MODEL_TOKEN_ENV: &str = "MODEL_SERVING_TOKEN";

/// Longest analysis window accepted, one leap year.
pub const MAX_WINDOW_HOURS: u64 = 24 * 366;

/// Longest scheduled-mode interval accepted, one week.
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Longest timeout accepted for any collaborator call, one day.
pub const MAX_TIMEOUT_SECONDS: u64 = 24 * 60 * 60;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Telemetry source settings.
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Model-serving settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Agent execution policy.
    #[serde(default)]
    pub scheduling: SchedulingConfig,

    /// Finding deduplication.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Run scoring.
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Report output.
    #[serde(default)]
    pub report: ReportConfig,

    /// Run tracking store.
    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// How the binary runs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// One run, then exit
    #[default]
    Once,
    /// Repeat every interval until interrupted
    Scheduled,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Agents to register, in order.
    #[serde(default = "default_agents")]
    pub agents: Vec<String>,

    /// Email domains treated as internal users.
    #[serde(default = "default_internal_domains")]
    pub internal_domains: Vec<String>,

    /// Length of the analysis window in hours.
    #[serde(default = "default_hours")]
    pub hours: u64,

    /// Run once or on a schedule.
    #[serde(default)]
    pub mode: RunMode,

    /// Minutes between scheduled runs.
    #[serde(default = "default_interval")]
    pub interval_minutes: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            agents: default_agents(),
            internal_domains: default_internal_domains(),
            hours: default_hours(),
            mode: RunMode::default(),
            interval_minutes: default_interval(),
        }
    }
}

fn default_agents() -> Vec<String> {
    agent::KNOWN_AGENTS.iter().map(|a| a.to_string()).collect()
}

fn default_internal_domains() -> Vec<String> {
    vec!["company.com".to_string(), "internal".to_string()]
}

fn default_hours() -> u64 {
    24
}

fn default_interval() -> u64 {
    60
}

/// Telemetry source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Generate synthetic telemetry instead of querying the platform.
    #[serde(default = "default_true")]
    pub use_mock_data: bool,

    /// Workspace URL.
    #[serde(default)]
    pub host: String,

    /// SQL warehouse used for system-table queries.
    #[serde(default)]
    pub warehouse_id: String,

    /// Request timeout in seconds.
    #[serde(default = "default_ingestion_timeout")]
    pub timeout_seconds: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            use_mock_data: true,
            host: String::new(),
            warehouse_id: String::new(),
            timeout_seconds: default_ingestion_timeout(),
        }
    }
}

fn default_ingestion_timeout() -> u64 {
    60
}

/// Model-serving settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Chat-completions endpoint. Empty means agents use their built-in
    /// heuristics.
    #[serde(default)]
    pub endpoint: String,

    /// Served model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Temperature for generation.
    #[serde(default)]
    pub temperature: f32,

    /// Maximum tokens in response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Request timeout in seconds.
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            name: default_model(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            timeout_seconds: default_model_timeout(),
        }
    }
}

fn default_model() -> String {
    ModelClientConfig::default().model_name
}

fn default_max_tokens() -> usize {
    1000
}

fn default_model_timeout() -> u64 {
    60
}

/// Agent execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Agents allowed to run at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout for a single agent attempt, in seconds.
    #[serde(default = "default_agent_timeout")]
    pub per_agent_timeout_seconds: u64,

    /// Attempts per agent, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Growth factor between retry delays.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            per_agent_timeout_seconds: default_agent_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_agent_timeout() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Finding deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Evidence keys compared between findings.
    #[serde(default = "default_dedup_keys")]
    pub dedup_keys: Vec<String>,

    /// Minimum fraction of matching keys for two findings to be duplicates.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            dedup_keys: default_dedup_keys(),
            dedup_threshold: default_dedup_threshold(),
        }
    }
}

fn default_dedup_keys() -> Vec<String> {
    DedupPolicy::default().key_set
}

fn default_dedup_threshold() -> f64 {
    DedupPolicy::default().threshold
}

/// Run scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_confidence_weight")]
    pub confidence_weight: f64,

    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,

    #[serde(default = "default_completeness_weight")]
    pub completeness_weight: f64,

    /// Findings above this confidence count as confident.
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,

    /// Score completeness against whether the window had audit activity.
    #[serde(default = "default_true")]
    pub activity_ground_truth: bool,

    /// Per-agent weight in the aggregate score (default 1.0).
    #[serde(default)]
    pub agent_weights: BTreeMap<String, f64>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            confidence_weight: default_confidence_weight(),
            latency_weight: default_latency_weight(),
            completeness_weight: default_completeness_weight(),
            confidence_floor: default_confidence_floor(),
            activity_ground_truth: true,
            agent_weights: BTreeMap::new(),
        }
    }
}

fn default_confidence_weight() -> f64 {
    0.4
}

fn default_latency_weight() -> f64 {
    0.3
}

fn default_completeness_weight() -> f64 {
    0.3
}

fn default_confidence_floor() -> f64 {
    0.6
}

/// Report output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directory receiving one report per run.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Report format.
    #[serde(default)]
    pub format: ReportFormat,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            format: ReportFormat::default(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("reports")
}

/// Run tracking store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Persist every finished run.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSON-lines file receiving one record per run.
    #[serde(default = "default_tracking_path")]
    pub path: PathBuf,

    /// JSON-lines file receiving every lifecycle event.
    #[serde(default = "default_events_path")]
    pub events_path: PathBuf,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_tracking_path(),
            events_path: default_events_path(),
        }
    }
}

fn default_tracking_path() -> PathBuf {
    PathBuf::from("reports").join("tracking.jsonl")
}

fn default_events_path() -> PathBuf {
    PathBuf::from("reports").join("events.jsonl")
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// Only values given explicitly on the command line override the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref agents) = args.agents {
            self.general.agents = agents.clone();
        }
        if let Some(hours) = args.hours {
            self.general.hours = hours;
        }
        if let Some(mode) = args.mode {
            self.general.mode = mode;
        }
        if let Some(interval) = args.interval {
            self.general.interval_minutes = interval;
        }

        if args.mock {
            self.ingestion.use_mock_data = true;
        }

        if let Some(concurrency) = args.max_concurrency {
            self.scheduling.max_concurrency = concurrency;
        }
        if let Some(timeout) = args.timeout {
            self.scheduling.per_agent_timeout_seconds = timeout;
        }
        if let Some(attempts) = args.max_attempts {
            self.scheduling.max_attempts = attempts;
        }

        if let Some(ref output_dir) = args.output_dir {
            self.report.output_dir = output_dir.clone();
        }
        if let Some(format) = args.format {
            self.report.format = format;
        }
        if args.no_tracking {
            self.tracking.enabled = false;
        }
    }

    /// Check cross-field constraints the types cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.general.agents.is_empty() {
            bail!("general.agents must name at least one agent");
        }
        if !(1..=MAX_WINDOW_HOURS).contains(&self.general.hours) {
            bail!("general.hours must be between 1 and {}", MAX_WINDOW_HOURS);
        }
        if self.general.mode == RunMode::Scheduled
            && !(1..=MAX_INTERVAL_MINUTES).contains(&self.general.interval_minutes)
        {
            bail!(
                "general.interval_minutes must be between 1 and {} in scheduled mode",
                MAX_INTERVAL_MINUTES
            );
        }

        if !self.ingestion.use_mock_data
            && (self.ingestion.host.is_empty() || self.ingestion.warehouse_id.is_empty())
        {
            bail!("ingestion.host and ingestion.warehouse_id are required unless use_mock_data is set");
        }
        check_timeout("ingestion.timeout_seconds", self.ingestion.timeout_seconds)?;

        if !(0.0..=1.0).contains(&self.model.temperature) {
            bail!("model.temperature must be between 0.0 and 1.0");
        }
        check_timeout("model.timeout_seconds", self.model.timeout_seconds)?;

        let scheduling = &self.scheduling;
        if scheduling.max_concurrency == 0 {
            bail!("scheduling.max_concurrency must be at least 1");
        }
        if scheduling.max_attempts == 0 {
            bail!("scheduling.max_attempts must be at least 1");
        }
        check_timeout(
            "scheduling.per_agent_timeout_seconds",
            scheduling.per_agent_timeout_seconds,
        )?;
        if !scheduling.backoff_multiplier.is_finite() || scheduling.backoff_multiplier < 1.0 {
            bail!("scheduling.backoff_multiplier must be a finite number >= 1.0");
        }

        if !(0.0..=1.0).contains(&self.aggregation.dedup_threshold) {
            bail!("aggregation.dedup_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.evaluation.confidence_floor) {
            bail!("evaluation.confidence_floor must be between 0.0 and 1.0");
        }
        self.evaluation_policy()
            .validate()
            .context("Invalid [evaluation] settings")?;

        Ok(())
    }

    /// Length of the analysis window.
    pub fn window(&self) -> Result<chrono::Duration> {
        i64::try_from(self.general.hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .with_context(|| format!("general.hours {} is out of range", self.general.hours))
    }

    /// Time between scheduled runs.
    pub fn interval(&self) -> Result<Duration> {
        self.general
            .interval_minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .with_context(|| {
                format!(
                    "general.interval_minutes {} is out of range",
                    self.general.interval_minutes
                )
            })
    }

    pub fn scheduling_policy(&self) -> SchedulingPolicy {
        SchedulingPolicy {
            max_concurrency: self.scheduling.max_concurrency,
            per_agent_timeout: Duration::from_secs(self.scheduling.per_agent_timeout_seconds),
            max_attempts: self.scheduling.max_attempts,
            retry_backoff: RetryBackoff {
                base: Duration::from_millis(self.scheduling.backoff_base_ms),
                multiplier: self.scheduling.backoff_multiplier,
            },
        }
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy {
            key_set: self.aggregation.dedup_keys.clone(),
            threshold: self.aggregation.dedup_threshold,
        }
    }

    /// Latency is scored against the per-agent timeout.
    pub fn evaluation_policy(&self) -> EvaluationPolicy {
        EvaluationPolicy {
            confidence_weight: self.evaluation.confidence_weight,
            latency_weight: self.evaluation.latency_weight,
            completeness_weight: self.evaluation.completeness_weight,
            confidence_floor: self.evaluation.confidence_floor,
            latency_ceiling: Duration::from_secs(self.scheduling.per_agent_timeout_seconds),
            agent_weights: self.evaluation.agent_weights.clone(),
        }
    }

    /// Build the model client, or `None` when no endpoint is configured.
    pub fn model_client(&self) -> Result<Option<ModelClient>> {
        if self.model.endpoint.trim().is_empty() {
            return Ok(None);
        }

        let token = std::env::var(MODEL_TOKEN_ENV)
            .or_else(|_| std::env::var(PLATFORM_TOKEN_ENV))
            .ok()
            .filter(|t| !t.is_empty());
        let client = ModelClient::new(ModelClientConfig {
            endpoint: self.model.endpoint.clone(),
            token,
            model_name: self.model.name.clone(),
            temperature: self.model.temperature,
            max_tokens: self.model.max_tokens,
            timeout: Duration::from_secs(self.model.timeout_seconds),
        })
        .context("Failed to build model-serving client")?;
        Ok(Some(client))
    }

    /// Build the immutable runtime wiring: agent registry plus policies.
    pub fn runtime(&self) -> Result<RuntimeConfig> {
        let agents = agent::build_registry(
            &self.general.agents,
            self.model_client()?,
            &self.general.internal_domains,
        )?;

        Ok(RuntimeConfig {
            agents,
            scheduling: self.scheduling_policy(),
            dedup: self.dedup_policy(),
            evaluation: self.evaluation_policy(),
            activity_ground_truth: self.evaluation.activity_ground_truth,
        })
    }

    /// Build the ingestion collaborator.
    pub fn ingestor(&self) -> Result<Arc<dyn Ingestor>> {
        if self.ingestion.use_mock_data {
            return Ok(Arc::new(MockIngestor::new()));
        }

        let token = std::env::var(PLATFORM_TOKEN_ENV).with_context(|| {
            format!("{} must be set when use_mock_data is false", PLATFORM_TOKEN_ENV)
        })?;
        let ingestor = WarehouseIngestor::new(WarehouseConfig {
            host: self.ingestion.host.clone(),
            token,
            warehouse_id: self.ingestion.warehouse_id.clone(),
            timeout: Duration::from_secs(self.ingestion.timeout_seconds),
        })?;
        Ok(Arc::new(ingestor))
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

fn check_timeout(name: &str, seconds: u64) -> Result<()> {
    if !(1..=MAX_TIMEOUT_SECONDS).contains(&seconds) {
        bail!("{} must be between 1 and {}", name, MAX_TIMEOUT_SECONDS);
    }
    Ok(())
}
