//! In-memory collaborators for tests.

use crate::agent::AgentCapability;
use crate::error::{AgentError, DeliveryError, IngestionError, TrackingError};
use crate::ingest::{DatasetRef, Ingestor};
use crate::models::{EvaluationRecord, Finding, RunContext, RunResult};
use crate::report::{Acknowledgement, Reporter};
use crate::tracking::RunTracker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a scripted agent does on one attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(Vec<Finding>),
    Fail(AgentError),
    /// Never completes.
    Hang,
}

/// Tracks how many agents run at once.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Agent that plays back scripted steps, then repeats a fallback.
pub struct ScriptedAgent {
    name: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    calls: AtomicU32,
    probe: Option<Arc<ConcurrencyProbe>>,
}

impl ScriptedAgent {
    pub fn new(name: &str, fallback: Step) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            probe: None,
        }
    }

    pub fn with_script(self, steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..self
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn with_probe(self, probe: Arc<ConcurrencyProbe>) -> Self {
        Self {
            probe: Some(probe),
            ..self
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentCapability for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(
        &self,
        _dataset: &DatasetRef,
        _context: &RunContext,
    ) -> Result<Vec<Finding>, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Some(ref probe) = self.probe {
            probe.enter();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(ref probe) = self.probe {
            probe.exit();
        }

        match step {
            Step::Succeed(findings) => Ok(findings),
            Step::Fail(error) => Err(error),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Ingestor returning a fixed dataset.
pub struct StaticIngestor {
    dataset: DatasetRef,
    pub windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl StaticIngestor {
    pub fn new(dataset: DatasetRef) -> Self {
        Self {
            dataset,
            windows: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Ingestor for StaticIngestor {
    async fn fetch(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<DatasetRef, IngestionError> {
        self.windows.lock().unwrap().push((window_start, window_end));
        Ok(self.dataset.clone())
    }
}

/// Ingestor that always fails.
pub struct FailingIngestor(pub IngestionError);

#[async_trait]
impl Ingestor for FailingIngestor {
    async fn fetch(
        &self,
        _window_start: DateTime<Utc>,
        _window_end: DateTime<Utc>,
    ) -> Result<DatasetRef, IngestionError> {
        Err(self.0.clone())
    }
}

/// Ingestor that never returns.
pub struct HangingIngestor;

#[async_trait]
impl Ingestor for HangingIngestor {
    async fn fetch(
        &self,
        _window_start: DateTime<Utc>,
        _window_end: DateTime<Utc>,
    ) -> Result<DatasetRef, IngestionError> {
        std::future::pending().await
    }
}

/// Reporter keeping deliveries in memory, optionally rejecting them.
#[derive(Default)]
pub struct MemoryReporter {
    pub delivered: Mutex<Vec<(RunResult, EvaluationRecord)>>,
    reject: bool,
}

impl MemoryReporter {
    pub fn rejecting() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            reject: true,
        }
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl Reporter for MemoryReporter {
    async fn deliver(
        &self,
        result: &RunResult,
        evaluation: &EvaluationRecord,
    ) -> Result<Acknowledgement, DeliveryError> {
        if self.reject {
            return Err(DeliveryError::Rejected("mailbox full".to_string()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((result.clone(), evaluation.clone()));
        Ok(Acknowledgement {
            location: format!("memory://{}", result.run_id),
        })
    }
}

/// Tracker keeping records in memory.
#[derive(Default)]
pub struct MemoryTracker {
    pub records: Mutex<Vec<(RunResult, EvaluationRecord)>>,
}

#[async_trait]
impl RunTracker for MemoryTracker {
    async fn record(
        &self,
        result: &RunResult,
        evaluation: &EvaluationRecord,
    ) -> Result<(), TrackingError> {
        self.records
            .lock()
            .unwrap()
            .push((result.clone(), evaluation.clone()));
        Ok(())
    }
}
