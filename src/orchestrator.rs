//! Run orchestration.
//!
//! One run moves strictly forward through
//! `Initialized → Ingesting → Scheduling → Aggregating → Evaluating → HandedOff`,
//! or drops into `Aborted` from any non-terminal state. Every transition is
//! published on the event sink.
//!
//! Runs are independent: each gets a fresh [`RunContext`]. The only state
//! carried between runs is the append-only dedup history and the pending
//! tracking writes.

use crate::agent::AgentCapability;
use crate::analysis::{
    Aggregator, DedupHistory, DedupPolicy, EvaluationPolicy, Evaluator, GroundTruth,
};
use crate::error::{EvaluationError, IngestionError, InvariantViolation, OrchestratorError};
use crate::events::{EventKind, EventSink, RunEvent};
use crate::ingest::Ingestor;
use crate::models::{AgentOutcome, EvaluationRecord, RunContext, RunResult};
use crate::report::{Acknowledgement, Reporter};
use crate::scheduler::{cancelled, Scheduler, SchedulingPolicy};
use crate::tracking::RunTracker;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Immutable wiring for every run: the agent registry and the policies.
///
/// Built once at startup and shared behind an `Arc`.
pub struct RuntimeConfig {
    pub agents: Vec<Arc<dyn AgentCapability>>,
    pub scheduling: SchedulingPolicy,
    pub dedup: DedupPolicy,
    pub evaluation: EvaluationPolicy,
    /// Use the ingested dataset's activity as ground truth for the
    /// completeness term.
    pub activity_ground_truth: bool,
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.agents.iter().map(|a| a.name()).collect();
        f.debug_struct("RuntimeConfig")
            .field("agents", &names)
            .field("scheduling", &self.scheduling)
            .field("dedup", &self.dedup)
            .field("evaluation", &self.evaluation)
            .field("activity_ground_truth", &self.activity_ground_truth)
            .finish()
    }
}

/// Lifecycle state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Initialized,
    Ingesting,
    Scheduling,
    Aggregating,
    Evaluating,
    HandedOff,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::HandedOff | RunState::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Initialized => "Initialized",
            RunState::Ingesting => "Ingesting",
            RunState::Scheduling => "Scheduling",
            RunState::Aggregating => "Aggregating",
            RunState::Evaluating => "Evaluating",
            RunState::HandedOff => "HandedOff",
            RunState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Why a run ended in `Aborted`.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    Ingestion(IngestionError),
    Cancelled { during: RunState },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Ingestion(e) => write!(f, "ingestion failed: {}", e),
            AbortReason::Cancelled { during } => write!(f, "cancelled during {}", during),
        }
    }
}

/// Everything the orchestrator knows about one run once it stops.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub context: RunContext,
    pub state: RunState,
    /// Every state entered, in order, starting with `Initialized`.
    pub transitions: Vec<RunState>,
    /// Outcomes resolved before the run stopped; empty if scheduling never ran.
    pub outcomes: Vec<AgentOutcome>,
    pub result: Option<RunResult>,
    pub evaluation: Option<EvaluationRecord>,
    pub abort_reason: Option<AbortReason>,
    pub acknowledgement: Option<Acknowledgement>,
    pub delivery_error: Option<String>,
}

impl RunRecord {
    fn new(context: RunContext) -> Self {
        Self {
            context,
            state: RunState::Initialized,
            transitions: vec![RunState::Initialized],
            outcomes: Vec::new(),
            result: None,
            evaluation: None,
            abort_reason: None,
            acknowledgement: None,
            delivery_error: None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state == RunState::Aborted
    }
}

/// Sequences one run through ingestion, scheduling, aggregation,
/// evaluation and handoff.
pub struct Orchestrator {
    runtime: Arc<RuntimeConfig>,
    ingestor: Arc<dyn Ingestor>,
    reporter: Arc<dyn Reporter>,
    tracker: Option<Arc<dyn RunTracker>>,
    sink: Arc<dyn EventSink>,
    scheduler: Scheduler,
    aggregator: Aggregator,
    evaluator: Evaluator,
    history: DedupHistory,
    pending_tracking: Mutex<JoinSet<()>>,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<RuntimeConfig>,
        ingestor: Arc<dyn Ingestor>,
        reporter: Arc<dyn Reporter>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, EvaluationError> {
        let evaluator = Evaluator::new(runtime.evaluation.clone())?;
        Ok(Self {
            scheduler: Scheduler::new(Arc::clone(&sink)),
            aggregator: Aggregator::new(runtime.dedup.clone()),
            evaluator,
            runtime,
            ingestor,
            reporter,
            tracker: None,
            sink,
            history: DedupHistory::new(),
            pending_tracking: Mutex::new(JoinSet::new()),
        })
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn RunTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Execute one complete run over `[window_start, window_end)`.
    ///
    /// Operational failures end up on the returned record. `Err` is reserved
    /// for invariant violations, which are bugs.
    #[instrument(skip_all, fields(correlation_id = correlation_id.as_deref().unwrap_or("-")))]
    pub async fn run_once(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        correlation_id: Option<String>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunRecord, OrchestratorError> {
        let context = RunContext::new(window_start, window_end, correlation_id)?;
        let mut run = RunRecord::new(context);
        info!(
            run_id = %run.context.run_id,
            "Run {} started for window {} to {}",
            run.context.short_id(),
            window_start.to_rfc3339(),
            window_end.to_rfc3339()
        );

        // Ingesting
        self.transition(&mut run, RunState::Ingesting);
        let fetched = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                self.abort(&mut run, AbortReason::Cancelled { during: RunState::Ingesting });
                return Ok(run);
            }
            fetched = self.ingestor.fetch(window_start, window_end) => fetched,
        };
        let dataset = match fetched {
            Ok(dataset) => dataset,
            Err(e) => {
                error!(run_id = %run.context.run_id, "Ingestion failed: {}", e);
                self.emit(&run, EventKind::Alert, format!("ingestion failed: {}", e));
                self.abort(&mut run, AbortReason::Ingestion(e));
                return Ok(run);
            }
        };
        info!(
            run_id = %run.context.run_id,
            "Ingested dataset {} ({})",
            dataset.short(),
            dataset.snapshot().summary()
        );
        let window_has_activity = dataset.snapshot().has_activity();
        run.context = run.context.clone().bind_dataset(dataset);

        // Scheduling
        self.transition(&mut run, RunState::Scheduling);
        let scheduled = self
            .scheduler
            .execute(
                &run.context,
                &self.runtime.agents,
                &self.runtime.scheduling,
                cancel.clone(),
            )
            .await;
        let report = scheduled.map_err(|e| self.fail_loudly(&mut run, e))?;
        run.outcomes = report.outcomes;
        if report.cancelled {
            self.abort(&mut run, AbortReason::Cancelled { during: RunState::Scheduling });
            return Ok(run);
        }

        // Aggregating
        self.transition(&mut run, RunState::Aggregating);
        let history = self.history.snapshot();
        let aggregated = self
            .aggregator
            .aggregate(&run.context, &run.outcomes, &history);
        let result = aggregated.map_err(|e| self.fail_loudly(&mut run, e))?;
        let remembered = self.history.append(&result, &self.runtime.dedup);
        debug!(run_id = %result.run_id, "Remembered {} new finding(s)", remembered);
        info!(
            run_id = %result.run_id,
            "Aggregated {} active finding(s), {} superseded, status {}",
            result.findings.len(),
            result.superseded.len(),
            result.run_status
        );

        // Evaluating
        self.transition(&mut run, RunState::Evaluating);
        let ground_truth = self
            .runtime
            .activity_ground_truth
            .then_some(GroundTruth { window_has_activity });
        let evaluation = match self.evaluator.evaluate(&result, ground_truth) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!(run_id = %result.run_id, "Evaluation failed, run is unscored: {}", e);
                self.emit(&run, EventKind::EvaluationFailed, e.to_string());
                EvaluationRecord::unscored(&result.run_id, format!("evaluation failed: {}", e))
            }
        };
        match evaluation.aggregate_score {
            Some(score) => debug!(run_id = %result.run_id, "Aggregate score {:.3}", score),
            None => debug!(run_id = %result.run_id, "Run is unscored"),
        }

        // HandedOff
        match self.reporter.deliver(&result, &evaluation).await {
            Ok(ack) => run.acknowledgement = Some(ack),
            Err(e) => {
                warn!(run_id = %result.run_id, "Report delivery failed: {}", e);
                self.emit(&run, EventKind::DeliveryFailed, e.to_string());
                run.delivery_error = Some(e.to_string());
            }
        }
        self.track(&result, &evaluation);

        run.result = Some(result);
        run.evaluation = Some(evaluation);
        self.transition(&mut run, RunState::HandedOff);
        Ok(run)
    }

    /// Run every `interval` over the trailing `window` until cancelled.
    ///
    /// A failing run is logged and the loop moves on. Returns how many runs
    /// were started.
    pub async fn run_scheduled(
        &self,
        interval: Duration,
        window: chrono::Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> u64 {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut runs = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                _ = ticker.tick() => {}
            }

            let window_end = Utc::now();
            let Some(window_start) = window_end.checked_sub_signed(window) else {
                error!("Window of {} is not representable, skipping run", window);
                continue;
            };
            runs += 1;
            match self
                .run_once(window_start, window_end, None, cancel.clone())
                .await
            {
                Ok(run) if run.is_aborted() => {
                    let reason = run
                        .abort_reason
                        .as_ref()
                        .map(|r| r.to_string())
                        .unwrap_or_default();
                    warn!(run_id = %run.context.run_id, "Run aborted: {}", reason);
                }
                Ok(run) => {
                    let status = run
                        .result
                        .as_ref()
                        .map(|r| r.run_status.to_string())
                        .unwrap_or_default();
                    info!(run_id = %run.context.run_id, "Run finished with status {}", status);
                }
                Err(e) => error!("Run failed: {}", e),
            }
            self.flush_tracking().await;
        }

        info!("Scheduled mode stopped after {} run(s)", runs);
        self.flush_tracking().await;
        runs
    }

    /// Wait for every outstanding tracking write. Returns how many finished.
    pub async fn flush_tracking(&self) -> usize {
        let mut pending = std::mem::take(
            &mut *self
                .pending_tracking
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut flushed = 0;
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(()) => flushed += 1,
                Err(e) => warn!("Tracking task did not finish: {}", e),
            }
        }
        flushed
    }

    fn track(&self, result: &RunResult, evaluation: &EvaluationRecord) {
        let Some(tracker) = self.tracker.as_ref().map(Arc::clone) else {
            return;
        };
        let sink = Arc::clone(&self.sink);
        let result = result.clone();
        let evaluation = evaluation.clone();

        self.pending_tracking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(async move {
                if let Err(e) = tracker.record(&result, &evaluation).await {
                    warn!(run_id = %result.run_id, "Failed to record run: {}", e);
                    sink.emit(RunEvent::new(
                        &result.run_id,
                        None,
                        EventKind::TrackingFailed,
                        e.to_string(),
                    ));
                }
            });
    }

    fn transition(&self, run: &mut RunRecord, next: RunState) {
        debug_assert!(!run.state.is_terminal());
        let detail = format!("{} -> {}", run.state, next);
        debug!(run_id = %run.context.run_id, "{}", detail);
        run.state = next;
        run.transitions.push(next);
        self.emit(run, EventKind::StateChanged, detail);
    }

    fn abort(&self, run: &mut RunRecord, reason: AbortReason) {
        warn!(run_id = %run.context.run_id, "Run aborted: {}", reason);
        run.abort_reason = Some(reason);
        self.transition(run, RunState::Aborted);
    }

    fn fail_loudly(&self, run: &mut RunRecord, violation: InvariantViolation) -> OrchestratorError {
        error!(run_id = %run.context.run_id, "Invariant violated in {}: {}", run.state, violation);
        self.emit(run, EventKind::Alert, format!("invariant violated: {}", violation));
        self.transition(run, RunState::Aborted);
        violation.into()
    }

    fn emit(&self, run: &RunRecord, kind: EventKind, detail: String) {
        self.sink
            .emit(RunEvent::new(&run.context.run_id, None, kind, detail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::events::MemorySink;
    use crate::ingest::{audit_event, Dataset, DatasetRef};
    use crate::models::{AgentStatus, Category, Finding, RunStatus, Severity};
    use crate::testing::{
        FailingIngestor, HangingIngestor, MemoryReporter, MemoryTracker, ScriptedAgent,
        StaticIngestor, Step,
    };
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        orchestrator: Orchestrator,
        sink: Arc<MemorySink>,
        reporter: Arc<MemoryReporter>,
    }

    fn runtime(agents: Vec<Arc<ScriptedAgent>>) -> RuntimeConfig {
        RuntimeConfig {
            agents: agents
                .into_iter()
                .map(|a| a as Arc<dyn AgentCapability>)
                .collect(),
            scheduling: SchedulingPolicy {
                per_agent_timeout: Duration::from_secs(10),
                ..Default::default()
            },
            dedup: DedupPolicy::default(),
            evaluation: EvaluationPolicy::default(),
            activity_ground_truth: false,
        }
    }

    fn active_dataset() -> DatasetRef {
        DatasetRef::seal(Dataset {
            audit_events: vec![audit_event("ana@company.com", "sql", "executeQuery", "10.0.0.4")],
            ..Default::default()
        })
    }

    fn harness_with(
        runtime: RuntimeConfig,
        ingestor: Arc<dyn Ingestor>,
        reporter: MemoryReporter,
    ) -> Harness {
        let sink = Arc::new(MemorySink::new());
        let reporter = Arc::new(reporter);
        let orchestrator =
            Orchestrator::new(Arc::new(runtime), ingestor, reporter.clone(), sink.clone()).unwrap();
        Harness {
            orchestrator,
            sink,
            reporter,
        }
    }

    fn harness(agents: Vec<Arc<ScriptedAgent>>) -> Harness {
        harness_with(
            runtime(agents),
            Arc::new(StaticIngestor::new(active_dataset())),
            MemoryReporter::default(),
        )
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc::now();
        (end - chrono::Duration::hours(24), end)
    }

    fn never_cancelled() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    fn network_finding(ip: &str) -> Finding {
        Finding::new(Category::Network, Severity::Medium, "External access")
            .with_evidence("source_ip_address", ip)
            .with_confidence(0.8)
    }

    fn security_finding(user: &str) -> Finding {
        Finding::new(Category::Security, Severity::High, "Failed secret read")
            .with_evidence("user_id", user)
            .with_evidence("action_name", "getSecret")
            .with_confidence(0.9)
    }

    fn state_events(sink: &MemorySink) -> usize {
        sink.events()
            .iter()
            .filter(|e| e.event_kind == EventKind::StateChanged)
            .count()
    }

    #[tokio::test]
    async fn test_all_agents_succeed_with_disjoint_findings() {
        let network = Arc::new(ScriptedAgent::new(
            "network",
            Step::Succeed(vec![network_finding("203.0.113.7")]),
        ));
        let security = Arc::new(ScriptedAgent::new(
            "security",
            Step::Succeed(vec![security_finding("ext@gmail.com")]),
        ));
        let h = harness(vec![network, security]);
        let (start, end) = window();

        let run = assert_ok!(
            h.orchestrator
                .run_once(start, end, Some("corr-1".to_string()), never_cancelled())
                .await
        );

        assert_eq!(run.state, RunState::HandedOff);
        assert_eq!(
            run.transitions,
            vec![
                RunState::Initialized,
                RunState::Ingesting,
                RunState::Scheduling,
                RunState::Aggregating,
                RunState::Evaluating,
                RunState::HandedOff,
            ]
        );
        let result = run.result.as_ref().unwrap();
        assert_eq!(result.run_status, RunStatus::Complete);
        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.correlation_id, "corr-1");
        assert_eq!(result.run_id, run.context.run_id);
        assert!(run.evaluation.as_ref().unwrap().is_scored());
        assert_eq!(h.reporter.count(), 1);
        assert!(run.acknowledgement.is_some());
        assert_eq!(state_events(&h.sink), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_agent_gives_partial_failure() {
        let network = Arc::new(ScriptedAgent::new("network", Step::Hang));
        let security = Arc::new(ScriptedAgent::new(
            "security",
            Step::Succeed(vec![security_finding("ext@gmail.com")]),
        ));
        let h = harness(vec![network, security]);
        let (start, end) = window();

        let run = assert_ok!(h.orchestrator.run_once(start, end, None, never_cancelled()).await);

        let result = run.result.as_ref().unwrap();
        assert_eq!(result.run_status, RunStatus::PartialFailure);
        assert_eq!(result.findings.len(), 1);
        let network = result.outcome("network").unwrap();
        assert_eq!(network.status, AgentStatus::TimedOut);
        assert_eq!(network.attempt_count, 3);
        assert_eq!(h.reporter.count(), 1);
    }

    #[tokio::test]
    async fn test_ingestion_failure_aborts_before_scheduling() {
        let agent = Arc::new(ScriptedAgent::new("security", Step::Succeed(vec![])));
        let h = harness_with(
            runtime(vec![agent.clone()]),
            Arc::new(FailingIngestor(IngestionError::Connection {
                endpoint: "https://example.cloud.databricks.com".to_string(),
                message: "connection refused".to_string(),
            })),
            MemoryReporter::default(),
        );
        let (start, end) = window();

        let run = assert_ok!(h.orchestrator.run_once(start, end, None, never_cancelled()).await);

        assert_eq!(run.state, RunState::Aborted);
        assert_eq!(
            run.transitions,
            vec![RunState::Initialized, RunState::Ingesting, RunState::Aborted]
        );
        assert!(!run.transitions.contains(&RunState::Scheduling));
        assert!(matches!(run.abort_reason, Some(AbortReason::Ingestion(_))));
        assert!(run.outcomes.is_empty());
        assert!(run.result.is_none());
        assert_eq!(agent.calls(), 0);
        assert_eq!(h.reporter.count(), 0);
        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| e.event_kind == EventKind::Alert));
    }

    #[tokio::test]
    async fn test_all_fatal_failures_give_unscored_failed_run() {
        let agents = ["network", "security"]
            .iter()
            .map(|name| {
                Arc::new(ScriptedAgent::new(
                    name,
                    Step::Fail(AgentError::fatal("model rejected request")),
                ))
            })
            .collect();
        let h = harness(agents);
        let (start, end) = window();

        let run = assert_ok!(h.orchestrator.run_once(start, end, None, never_cancelled()).await);

        assert_eq!(run.state, RunState::HandedOff);
        let result = run.result.as_ref().unwrap();
        assert_eq!(result.run_status, RunStatus::Failed);
        assert!(result.findings.is_empty());
        let evaluation = run.evaluation.as_ref().unwrap();
        assert!(!evaluation.is_scored());
        assert_eq!(evaluation.aggregate_score, None);
        // Failed runs are still reported.
        assert_eq!(h.reporter.count(), 1);
    }

    #[tokio::test]
    async fn test_evaluation_failure_is_delivered_unscored() {
        let network = Arc::new(ScriptedAgent::new(
            "network",
            Step::Succeed(vec![network_finding("203.0.113.7")]),
        ));
        let security = Arc::new(ScriptedAgent::new("security", Step::Succeed(vec![])));
        let mut runtime = runtime(vec![network, security]);
        for agent in ["network", "security"] {
            runtime
                .evaluation
                .agent_weights
                .insert(agent.to_string(), f64::MAX);
        }
        let h = harness_with(
            runtime,
            Arc::new(StaticIngestor::new(active_dataset())),
            MemoryReporter::default(),
        );
        let (start, end) = window();

        let run = assert_ok!(h.orchestrator.run_once(start, end, None, never_cancelled()).await);

        assert_eq!(run.state, RunState::HandedOff);
        assert_eq!(run.result.as_ref().unwrap().run_status, RunStatus::Complete);
        let evaluation = run.evaluation.as_ref().unwrap();
        assert!(!evaluation.is_scored());
        assert_eq!(evaluation.aggregate_score, None);
        let failures = h
            .sink
            .events()
            .iter()
            .filter(|e| e.event_kind == EventKind::EvaluationFailed)
            .count();
        assert_eq!(failures, 1);
        assert_eq!(h.reporter.count(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_still_hands_off() {
        let agent = Arc::new(ScriptedAgent::new("security", Step::Succeed(vec![])));
        let h = harness_with(
            runtime(vec![agent]),
            Arc::new(StaticIngestor::new(active_dataset())),
            MemoryReporter::rejecting(),
        );
        let (start, end) = window();

        let run = assert_ok!(h.orchestrator.run_once(start, end, None, never_cancelled()).await);

        assert_eq!(run.state, RunState::HandedOff);
        assert!(run.result.is_some());
        assert!(run.delivery_error.as_deref().unwrap().contains("mailbox full"));
        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| e.event_kind == EventKind::DeliveryFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_scheduling_keeps_resolved_outcomes() {
        let done = Arc::new(ScriptedAgent::new(
            "security",
            Step::Succeed(vec![security_finding("ext@gmail.com")]),
        ));
        let hung = Arc::new(ScriptedAgent::new("network", Step::Hang));
        let h = harness(vec![done, hung]);
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let _ = tx.send(true);
        });
        let (start, end) = window();

        let run = assert_ok!(h.orchestrator.run_once(start, end, None, rx).await);

        assert_eq!(run.state, RunState::Aborted);
        assert_eq!(
            run.abort_reason,
            Some(AbortReason::Cancelled {
                during: RunState::Scheduling
            })
        );
        assert_eq!(run.outcomes.len(), 2);
        assert_eq!(run.outcomes[0].status, AgentStatus::Succeeded);
        assert_eq!(run.outcomes[1].status, AgentStatus::Skipped);
        assert!(run.result.is_none());
        assert_eq!(h.reporter.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_ingestion() {
        let agent = Arc::new(ScriptedAgent::new("security", Step::Succeed(vec![])));
        let h = harness_with(
            runtime(vec![agent.clone()]),
            Arc::new(HangingIngestor),
            MemoryReporter::default(),
        );
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = tx.send(true);
        });
        let (start, end) = window();

        let run = assert_ok!(h.orchestrator.run_once(start, end, None, rx).await);

        assert_eq!(
            run.abort_reason,
            Some(AbortReason::Cancelled {
                during: RunState::Ingesting
            })
        );
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_inverted_window_is_invariant_violation() {
        let h = harness(vec![Arc::new(ScriptedAgent::new(
            "security",
            Step::Succeed(vec![]),
        ))]);
        let (start, end) = window();

        let err = assert_err!(h.orchestrator.run_once(end, start, None, never_cancelled()).await);
        assert!(matches!(
            err,
            OrchestratorError::Invariant(InvariantViolation::InvalidWindow { .. })
        ));
        assert_eq!(h.reporter.count(), 0);
    }

    #[tokio::test]
    async fn test_second_run_marks_recurring_findings() {
        let agent = Arc::new(ScriptedAgent::new(
            "security",
            Step::Succeed(vec![security_finding("ext@gmail.com")]),
        ));
        let h = harness(vec![agent]);
        let (start, end) = window();

        let first = assert_ok!(h.orchestrator.run_once(start, end, None, never_cancelled()).await);
        let second = assert_ok!(h.orchestrator.run_once(start, end, None, never_cancelled()).await);

        assert_ne!(first.context.run_id, second.context.run_id);
        assert!(!first.result.unwrap().findings[0].recurring);
        assert!(second.result.unwrap().findings[0].recurring);
    }

    #[tokio::test]
    async fn test_repeated_runs_keep_one_history_entry() {
        let agent = Arc::new(ScriptedAgent::new(
            "security",
            Step::Succeed(vec![security_finding("ext@gmail.com")]),
        ));
        let h = harness(vec![agent]);
        let (start, end) = window();

        for _ in 0..50 {
            assert_ok!(h.orchestrator.run_once(start, end, None, never_cancelled()).await);
        }

        assert_eq!(h.orchestrator.history.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_activity_ground_truth_feeds_completeness() {
        let agent = Arc::new(ScriptedAgent::new("security", Step::Succeed(vec![])));
        let h = harness_with(
            RuntimeConfig {
                activity_ground_truth: true,
                ..runtime(vec![agent])
            },
            Arc::new(StaticIngestor::new(active_dataset())),
            MemoryReporter::default(),
        );
        let (start, end) = window();

        let run = assert_ok!(h.orchestrator.run_once(start, end, None, never_cancelled()).await);

        let scores = &run.evaluation.unwrap().agent_scores;
        assert_eq!(scores["security"].completeness_term, Some(0.0));
        assert_eq!(scores["security"].confidence_term, None);
    }

    #[tokio::test]
    async fn test_tracking_writes_are_flushed() {
        let agent = Arc::new(ScriptedAgent::new("security", Step::Succeed(vec![])));
        let tracker = Arc::new(MemoryTracker::default());
        let h = harness(vec![agent]);
        let orchestrator = h.orchestrator.with_tracker(tracker.clone());
        let (start, end) = window();

        let run = assert_ok!(orchestrator.run_once(start, end, None, never_cancelled()).await);
        assert_eq!(orchestrator.flush_tracking().await, 1);

        let records = tracker.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0.run_id, run.context.run_id);
        assert_eq!(records[0].1.run_id, run.context.run_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_mode_runs_until_cancelled() {
        let agent = Arc::new(ScriptedAgent::new("security", Step::Succeed(vec![])));
        let ingestor = Arc::new(StaticIngestor::new(active_dataset()));
        let h = harness_with(runtime(vec![agent]), ingestor.clone(), MemoryReporter::default());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(150)).await;
            let _ = tx.send(true);
        });

        let runs = h
            .orchestrator
            .run_scheduled(Duration::from_secs(60), chrono::Duration::hours(1), rx)
            .await;

        assert_eq!(runs, 3);
        assert_eq!(h.reporter.count(), 3);
        let windows = ingestor.windows.lock().unwrap();
        assert!(windows
            .iter()
            .all(|(start, end)| *end - *start == chrono::Duration::hours(1)));
    }
}
