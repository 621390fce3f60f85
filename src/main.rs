//! insight-agent - multi-agent telemetry insight pipeline
//!
//! A CLI tool that ingests platform telemetry for a time window, fans it out
//! to specialized analysis agents, merges and scores their findings, and
//! writes a report per run.
//!
//! Exit codes:
//!   0 - Success (no findings above threshold, or no --fail-on set)
//!   1 - Runtime error (config, ingestion failure, aborted run, etc.)
//!   2 - Findings found at or above --fail-on threshold

mod agent;
mod analysis;
mod cli;
mod config;
mod error;
mod events;
mod ingest;
mod models;
mod orchestrator;
mod report;
mod scheduler;
#[cfg(test)]
mod testing;
mod tracking;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cli::Args;
use config::{Config, RunMode, DEFAULT_CONFIG_FILE};
use events::{ChannelSink, EventSink, FanoutSink, TracingSink};
use indicatif::{ProgressBar, ProgressStyle};
use ingest::Ingestor;
use models::{RunStatus, Severity};
use orchestrator::{Orchestrator, RunRecord};
use report::FileReporter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tracking::JsonlTracker;

/// Overrides the CLI verbosity when set, e.g. `INSIGHT_LOG=insight_agent=trace`.
const LOG_ENV: &str = "INSIGHT_LOG";

/// Events buffered for the event log before new ones are dropped.
const EVENT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("insight-agent v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .insight-agent.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Set DATABRICKS_TOKEN (and MODEL_SERVING_TOKEN) in the environment;");
    println!("   tokens are never read from the config file.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let installed = match EnvFilter::try_from_env(LOG_ENV) {
        Ok(filter) => {
            tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())
        }
        Err(_) => tracing::subscriber::set_global_default(
            builder.with_max_level(args.log_level()).finish(),
        ),
    };
    installed.expect("Failed to set tracing subscriber");
}

/// Load, merge and validate configuration, then dispatch on mode.
async fn run(args: Args) -> Result<i32> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate().context("Invalid configuration")?;

    let ingestor = config.ingestor()?;
    let window = config.window()?;

    // Handle --dry-run: ingest only
    if args.dry_run {
        return handle_dry_run(ingestor.as_ref(), window).await;
    }

    let runtime = Arc::new(config.runtime()?);
    let agent_names: Vec<&str> = runtime.agents.iter().map(|a| a.name()).collect();

    println!("🤖 Initializing insight pipeline...");
    println!("   Agents: {}", agent_names.join(", "));
    println!(
        "   Source: {}",
        if config.ingestion.use_mock_data {
            "synthetic telemetry"
        } else {
            config.ingestion.host.as_str()
        }
    );
    println!(
        "   Model: {}",
        if config.model.endpoint.is_empty() {
            "built-in heuristics"
        } else {
            config.model.name.as_str()
        }
    );
    println!("   Window: {}h", config.general.hours);
    println!(
        "   Concurrency: {} | Timeout: {}s | Attempts: {}",
        runtime.scheduling.max_concurrency,
        runtime.scheduling.per_agent_timeout.as_secs(),
        runtime.scheduling.max_attempts
    );

    let mut event_writer = None;
    let sink: Arc<dyn EventSink> = if config.tracking.enabled {
        let (channel, receiver) = ChannelSink::new(EVENT_BUFFER);
        event_writer = Some(tokio::spawn(events::write_jsonl(
            config.tracking.events_path.clone(),
            receiver,
        )));
        let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink), Arc::new(channel)];
        Arc::new(FanoutSink::new(sinks))
    } else {
        Arc::new(TracingSink)
    };
    let reporter = Arc::new(FileReporter::new(
        &config.report.output_dir,
        config.report.format,
    ));
    let mut orchestrator = Orchestrator::new(runtime, ingestor, reporter, sink)
        .context("Invalid evaluation policy")?;
    if config.tracking.enabled {
        orchestrator =
            orchestrator.with_tracker(Arc::new(JsonlTracker::new(&config.tracking.path)));
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let exit_code = match config.general.mode {
        RunMode::Scheduled => {
            let interval = config.interval()?;
            println!(
                "\n⏱️  Scheduled mode: one run every {} minute(s). Ctrl-C to stop.\n",
                config.general.interval_minutes
            );
            let runs = orchestrator.run_scheduled(interval, window, cancel_rx).await;
            println!("\n✅ Stopped after {} run(s).", runs);
            Ok(0)
        }
        RunMode::Once => {
            let code = run_single(&orchestrator, &args, window, cancel_rx).await;
            let flushed = orchestrator.flush_tracking().await;
            debug!("Flushed {} tracking write(s)", flushed);
            code
        }
    };

    // Dropping the orchestrator closes the event channel.
    drop(orchestrator);
    if let Some(writer) = event_writer {
        match writer.await {
            Ok(Ok(written)) => debug!("Wrote {} event(s)", written),
            Ok(Err(e)) => warn!("Failed to write event log: {}", e),
            Err(e) => warn!("Event log writer did not finish: {}", e),
        }
    }

    exit_code
}

/// Execute one run with a spinner and print its summary. Returns the exit code.
async fn run_single(
    orchestrator: &Orchestrator,
    args: &Args,
    window: chrono::Duration,
    cancel: watch::Receiver<bool>,
) -> Result<i32> {
    let start_time = Instant::now();
    let spinner = (!args.quiet).then(|| {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) =
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            pb.set_style(style);
        }
        pb.set_message("Running analysis agents...");
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    });

    let window_end = Utc::now();
    let window_start = window_start(window_end, window)?;
    let outcome = orchestrator
        .run_once(
            window_start,
            window_end,
            args.correlation_id.clone(),
            cancel,
        )
        .await;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let run = outcome?;

    debug!("Transitions: {:?}", run.transitions);
    print_summary(&run, start_time.elapsed());

    if run.is_aborted() {
        return Ok(1);
    }

    // Check --fail-on threshold
    if let (Some(fail_level), Some(result)) = (args.fail_on, run.result.as_ref()) {
        let threshold = Severity::from(fail_level);
        if result.findings.iter().any(|f| f.finding.severity >= threshold) {
            eprintln!(
                "\n⛔ Findings at or above {} severity. Failing (exit code 2).",
                threshold
            );
            return Ok(2);
        }
    }

    Ok(0)
}

fn print_summary(run: &RunRecord, elapsed: Duration) {
    let (Some(result), Some(evaluation)) = (run.result.as_ref(), run.evaluation.as_ref()) else {
        let reason = run
            .abort_reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("\n❌ Run {} aborted: {}", run.context.short_id(), reason);
        eprintln!("   No report was produced.");
        return;
    };

    println!("\n📊 Run Summary:");
    println!("   Run: {}", result.run_id);
    println!("   Status: {}", result.run_status);
    for outcome in &result.outcomes {
        println!(
            "   - {}: {} ({} finding(s), {} attempt(s), {:.1}s)",
            outcome.agent_name,
            outcome.status,
            outcome.findings.len(),
            outcome.attempt_count,
            outcome.duration.as_secs_f64()
        );
    }
    println!(
        "   Findings: {} active, {} superseded",
        result.findings.len(),
        result.superseded.len()
    );
    println!(
        "   Threat level: {} {}",
        result.threat_level.emoji(),
        result.threat_level
    );
    match evaluation.aggregate_score {
        Some(score) if evaluation.is_scored() => println!("   Score: {:.2}", score),
        _ => println!("   Score: unscored"),
    }
    println!("   Duration: {:.1}s", elapsed.as_secs_f64());

    if result.run_status == RunStatus::PartialFailure {
        println!("\n⚠️  Partial failure: some agents did not succeed.");
    }
    match (&run.acknowledgement, &run.delivery_error) {
        (Some(ack), _) => println!("\n✅ Run complete! Report saved to: {}", ack.location),
        (None, Some(e)) => eprintln!("\n⚠️  Run complete, but the report was not delivered: {}", e),
        (None, None) => println!("\n✅ Run complete!"),
    }
}

/// Handle --dry-run: ingest the window, print what the agents would see, exit.
async fn handle_dry_run(ingestor: &dyn Ingestor, window: chrono::Duration) -> Result<i32> {
    println!("\n🔍 Dry run: ingesting telemetry (no agents are run)...\n");

    let window_end = Utc::now();
    let window_start = window_start(window_end, window)?;
    let dataset = ingestor
        .fetch(window_start, window_end)
        .await
        .context("Ingestion failed")?;

    println!(
        "   Window: {} to {}",
        window_start.to_rfc3339(),
        window_end.to_rfc3339()
    );
    println!("   Dataset: {}", dataset.digest());
    println!("   Rows: {}", dataset.snapshot().summary());

    println!("\n✅ Dry run complete. No agents were run.");
    Ok(0)
}

fn window_start(window_end: DateTime<Utc>, window: chrono::Duration) -> Result<DateTime<Utc>> {
    window_end
        .checked_sub_signed(window)
        .context("Analysis window reaches before the earliest representable time")
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
