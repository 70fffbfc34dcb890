use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Lifecycle events emitted by the orchestration core.
///
/// Exporters live outside the core; this stream (plus the mirrored
/// `tracing` records) is the hook point for metrics and log shipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A job was accepted and enqueued.
    JobSubmitted,
    /// The coordinator derived tasks for a job.
    JobRouted,
    /// A task was handed to its agent.
    TaskDispatched,
    /// A task reached a terminal state.
    TaskTerminal,
    /// A job reached a terminal state and its report was persisted.
    JobTerminal,
    /// A result callback arrived for an already-terminal task and was
    /// discarded.
    DuplicateResult,
}

/// One entry of the orchestration event stream.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationEvent {
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
    /// The job the event belongs to.
    pub job_id: Uuid,
    /// The task, for task-scoped events.
    pub task_id: Option<Uuid>,
    /// The agent involved, when known.
    pub agent_id: Option<String>,
    /// Event-specific payload.
    pub details: serde_json::Value,
}

/// Append-only orchestration event log.
///
/// Every event is mirrored to `tracing`; when constructed with a
/// directory, events are additionally appended to `events.jsonl` by a
/// background task fed over an unbounded channel, so emitting never
/// blocks the state machine.
pub struct EventLog {
    tx: Option<mpsc::UnboundedSender<OrchestrationEvent>>,
}

impl EventLog {
    /// Create a log that appends JSONL entries under `log_dir`.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<OrchestrationEvent>();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;

            let _ = tokio::fs::create_dir_all(&log_dir).await;
            let log_file = log_dir.join("events.jsonl");

            while let Some(event) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&event) else {
                    continue;
                };
                line.push('\n');
                let result = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_file)
                    .await;
                if let Ok(mut file) = result {
                    let _ = file.write_all(line.as_bytes()).await;
                }
            }
        });

        Self { tx: Some(tx) }
    }

    /// Create a log that only mirrors to `tracing`.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit one event.
    pub fn emit(&self, event: OrchestrationEvent) {
        info!(
            kind = ?event.kind,
            job_id = %event.job_id,
            task_id = ?event.task_id,
            agent_id = ?event.agent_id,
            "orchestration event"
        );
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Convenience wrapper building the entry in place.
    pub fn record(
        &self,
        kind: EventKind,
        job_id: Uuid,
        task_id: Option<Uuid>,
        agent_id: Option<String>,
        details: serde_json::Value,
    ) {
        self.emit(OrchestrationEvent {
            timestamp: Utc::now(),
            kind,
            job_id,
            task_id,
            agent_id,
            details,
        });
    }
}
