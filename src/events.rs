//! Observability events for run lifecycle transitions.
//!
//! Every scheduler and orchestrator transition is emitted as a [`RunEvent`]
//! into an [`EventSink`]. Sinks are best-effort: `emit` must never block the
//! pipeline and must never fail it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChanged,
    AgentStarted,
    AgentRetrying,
    AgentSucceeded,
    AgentFailed,
    AgentTimedOut,
    AgentSkipped,
    EvaluationFailed,
    DeliveryFailed,
    TrackingFailed,
    Alert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChanged => "run.state_changed",
            EventKind::AgentStarted => "agent.started",
            EventKind::AgentRetrying => "agent.retrying",
            EventKind::AgentSucceeded => "agent.succeeded",
            EventKind::AgentFailed => "agent.failed",
            EventKind::AgentTimedOut => "agent.timed_out",
            EventKind::AgentSkipped => "agent.skipped",
            EventKind::EvaluationFailed => "run.evaluation_failed",
            EventKind::DeliveryFailed => "run.delivery_failed",
            EventKind::TrackingFailed => "run.tracking_failed",
            EventKind::Alert => "run.alert",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record on the observability stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub event_kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl RunEvent {
    pub fn new(
        run_id: impl Into<String>,
        agent_name: Option<&str>,
        event_kind: EventKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            agent_name: agent_name.map(String::from),
            event_kind,
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }
}

/// Append-only, best-effort event stream.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// Forwards events to `tracing` with structured fields.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: RunEvent) {
        let agent = event.agent_name.as_deref().unwrap_or("-");
        match event.event_kind {
            EventKind::Alert => error!(
                event = %event.event_kind,
                run_id = %event.run_id,
                detail = %event.detail,
            ),
            EventKind::AgentFailed
            | EventKind::AgentTimedOut
            | EventKind::AgentSkipped
            | EventKind::EvaluationFailed
            | EventKind::DeliveryFailed
            | EventKind::TrackingFailed => warn!(
                event = %event.event_kind,
                run_id = %event.run_id,
                agent_name = %agent,
                detail = %event.detail,
            ),
            _ => info!(
                event = %event.event_kind,
                run_id = %event.run_id,
                agent_name = %agent,
                detail = %event.detail,
            ),
        }
    }
}

/// Pushes events into a bounded channel; drops them when the consumer lags.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<RunEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RunEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: RunEvent) {
        // Full or closed channel: drop the event.
        let _ = self.sender.try_send(event);
    }
}

/// Sends every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: RunEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Keeps every event in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<RunEvent>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn kinds_for(&self, agent_name: &str) -> Vec<EventKind> {
        self.events()
            .into_iter()
            .filter(|e| e.agent_name.as_deref() == Some(agent_name))
            .map(|e| e.event_kind)
            .collect()
    }
}

#[cfg(test)]
impl EventSink for MemorySink {
    fn emit(&self, event: RunEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Drain a channel sink's receiver into a JSON-lines file until every
/// sender is dropped. Returns the number of events written.
pub async fn write_jsonl(
    path: impl AsRef<Path>,
    mut receiver: mpsc::Receiver<RunEvent>,
) -> std::io::Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    let mut written = 0;
    while let Some(event) = receiver.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        written += 1;
    }
    file.flush().await?;
    Ok(written)
}
