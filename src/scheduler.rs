//! Bounded-concurrency agent execution.
//!
//! Every registered agent runs in its own task under a shared semaphore.
//! Each attempt is wrapped in a timeout; transient failures are retried with
//! exponential backoff; a run-level cancellation signal stops everything.
//! Outcomes come back in registration order whatever the completion order.

use crate::agent::AgentCapability;
use crate::error::{AgentError, InvariantViolation};
use crate::events::{EventKind, EventSink, RunEvent};
use crate::ingest::DatasetRef;
use crate::models::{AgentOutcome, RunContext};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::instrument;

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Stand-in for "no deadline" when the configured bound is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Exponential retry delay: `base * multiplier^(retry - 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub multiplier: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

/// How agents are run within one scheduling pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingPolicy {
    pub max_concurrency: usize,
    pub per_agent_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: RetryBackoff,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            per_agent_timeout: Duration::from_secs(120),
            max_attempts: 3,
            retry_backoff: RetryBackoff::default(),
        }
    }
}

impl SchedulingPolicy {
    /// Longest any single agent may occupy the scheduler once started.
    ///
    /// Saturates at thirty years.
    pub fn wait_bound(&self) -> Duration {
        self.per_agent_timeout
            .checked_mul(self.max_attempts.max(1))
            .unwrap_or(FAR_FUTURE)
            .min(FAR_FUTURE)
    }
}

/// Result of one scheduling pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleReport {
    /// One per registered agent, in registration order.
    pub outcomes: Vec<AgentOutcome>,
    /// The run-level cancellation signal fired during the pass.
    pub cancelled: bool,
}

/// Runs agent capabilities against a bound run context.
#[derive(Clone)]
pub struct Scheduler {
    sink: Arc<dyn EventSink>,
}

impl Scheduler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Run every agent once (with retries) and collect their outcomes.
    ///
    /// Never fails because of agent behavior; errors are reserved for
    /// callers breaking the contract (unbound context, duplicate names).
    #[instrument(skip_all, fields(run_id = %context.run_id))]
    pub async fn execute(
        &self,
        context: &RunContext,
        agents: &[Arc<dyn AgentCapability>],
        policy: &SchedulingPolicy,
        cancel: watch::Receiver<bool>,
    ) -> Result<ScheduleReport, InvariantViolation> {
        let dataset = context
            .dataset_ref
            .clone()
            .ok_or(InvariantViolation::UnboundDataset)?;

        let mut names = BTreeSet::new();
        for agent in agents {
            if !names.insert(agent.name()) {
                return Err(InvariantViolation::DuplicateAgent {
                    agent: agent.name().to_string(),
                });
            }
        }

        let context = Arc::new(context.clone());
        let semaphore = Arc::new(Semaphore::new(policy.max_concurrency.max(1)));

        let handles: Vec<_> = agents
            .iter()
            .map(|agent| {
                let agent = Arc::clone(agent);
                let dataset = dataset.clone();
                let context = Arc::clone(&context);
                let policy = policy.clone();
                let sink = Arc::clone(&self.sink);
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    run_agent(agent, dataset, context, policy, sink, semaphore, cancel).await
                })
            })
            .collect();

        let joined = futures::future::join_all(handles).await;

        let outcomes = joined
            .into_iter()
            .zip(agents)
            .map(|(joined, agent)| {
                joined.unwrap_or_else(|e| {
                    let error = AgentError::fatal(format!("agent task aborted: {}", e));
                    self.emit(&context, agent.name(), EventKind::AgentFailed, error.to_string());
                    AgentOutcome::failed(agent.name(), error, Duration::ZERO, 0)
                })
            })
            .collect();

        let cancelled = *cancel.borrow();
        Ok(ScheduleReport {
            outcomes,
            cancelled,
        })
    }

    fn emit(&self, context: &RunContext, agent: &str, kind: EventKind, detail: String) {
        self.sink
            .emit(RunEvent::new(&context.run_id, Some(agent), kind, detail));
    }
}

/// Resolves once the cancellation flag is set. Never resolves if the
/// sender is dropped without cancelling.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_agent(
    agent: Arc<dyn AgentCapability>,
    dataset: DatasetRef,
    context: Arc<RunContext>,
    policy: SchedulingPolicy,
    sink: Arc<dyn EventSink>,
    semaphore: Arc<Semaphore>,
    mut cancel: watch::Receiver<bool>,
) -> AgentOutcome {
    let name = agent.name().to_string();
    let emit = |kind: EventKind, detail: String| {
        sink.emit(RunEvent::new(&context.run_id, Some(&name), kind, detail));
    };
    let max_attempts = policy.max_attempts.max(1);

    let _permit = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => {
            emit(EventKind::AgentSkipped, "run cancelled before start".to_string());
            return AgentOutcome::skipped(&name, "run cancelled before start", Duration::ZERO, 0);
        }
        permit = Arc::clone(&semaphore).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                emit(EventKind::AgentSkipped, "scheduler closed".to_string());
                return AgentOutcome::skipped(&name, "scheduler closed", Duration::ZERO, 0);
            }
        },
    };

    let started = Instant::now();
    let deadline = started + policy.wait_bound();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let limit = policy.per_agent_timeout.min(remaining);
        emit(
            EventKind::AgentStarted,
            format!("attempt {}/{} (limit {:?})", attempt, max_attempts, limit),
        );

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                emit(EventKind::AgentSkipped, format!("run cancelled during attempt {}", attempt));
                return AgentOutcome::skipped(&name, "run cancelled", started.elapsed(), attempt);
            }
            result = tokio::time::timeout(limit, agent.analyze(&dataset, &context)) => result,
        };

        match result {
            Ok(Ok(findings)) => {
                emit(
                    EventKind::AgentSucceeded,
                    format!("{} finding(s) after {} attempt(s)", findings.len(), attempt),
                );
                return AgentOutcome::succeeded(&name, findings, started.elapsed(), attempt);
            }
            Ok(Err(error)) if error.is_retryable() && attempt < max_attempts => {
                let left = deadline.saturating_duration_since(Instant::now());
                let delay = policy.retry_backoff.delay(attempt).min(left);
                emit(
                    EventKind::AgentRetrying,
                    format!("{}; retrying in {:?}", error, delay),
                );

                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => {
                        emit(EventKind::AgentSkipped, "run cancelled during backoff".to_string());
                        return AgentOutcome::skipped(&name, "run cancelled", started.elapsed(), attempt);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                if Instant::now() >= deadline {
                    emit(
                        EventKind::AgentFailed,
                        format!("{}; wait bound exhausted", error),
                    );
                    return AgentOutcome::failed(&name, error, started.elapsed(), attempt);
                }
            }
            Ok(Err(error)) => {
                emit(EventKind::AgentFailed, error.to_string());
                return AgentOutcome::failed(&name, error, started.elapsed(), attempt);
            }
            Err(_) if attempt < max_attempts && Instant::now() < deadline => {
                emit(
                    EventKind::AgentRetrying,
                    format!("attempt {} timed out after {:?}", attempt, limit),
                );
            }
            Err(_) => {
                emit(
                    EventKind::AgentTimedOut,
                    format!("timed out after {} attempt(s)", attempt),
                );
                return AgentOutcome::timed_out(
                    &name,
                    policy.per_agent_timeout,
                    started.elapsed(),
                    attempt,
                );
            }
        }
    }
}
