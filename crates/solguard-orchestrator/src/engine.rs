use crate::dispatch::TaskDispatcher;
use crate::events::{EventKind, EventLog};
use crate::jobs::{ApplyOutcome, CancelOutcome, JobTable};
use chrono::{Duration as ChronoDuration, Utc};
use solguard_core::{Finding, SolguardError, SolguardResult, Task, TaskStatus};
use solguard_registry::AgentRegistry;
use solguard_sink::ResultsSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that advance the per-job state machine.
///
/// The engine mutates job state only in response to these messages; it
/// never polls agents directly, which keeps it the single writer per job.
#[derive(Debug)]
pub enum JobEvent {
    /// The coordinator derived tasks for a job.
    JobRouted {
        /// The routed job.
        job_id: Uuid,
        /// Its tasks, in seq order.
        tasks: Vec<Task>,
    },
    /// The coordinator could not route the job.
    RoutingFailed {
        /// The failed job.
        job_id: Uuid,
        /// User-visible reason (`no_capable_agent`, `unknown_pipeline`).
        reason: String,
    },
    /// A task was handed to its agent.
    TaskDispatched {
        /// The dispatched task.
        task_id: Uuid,
        /// The receiving agent.
        agent_id: String,
        /// 1-based dispatch attempt that succeeded.
        attempt: u32,
    },
    /// Agent callback: the analysis finished.
    TaskSucceeded {
        /// The finished task.
        task_id: Uuid,
        /// Findings reported by the agent.
        findings: Vec<Finding>,
    },
    /// Agent callback: the analysis failed. Also sent by the coordinator
    /// when dispatch retries are exhausted.
    TaskFailed {
        /// The failed task.
        task_id: Uuid,
        /// Failure reason.
        reason: String,
    },
    /// Client cancellation.
    CancelJob {
        /// The job to cancel.
        job_id: Uuid,
    },
}

/// Cloneable sender half of the engine's event channel.
///
/// Agents must call [`task_succeeded`](Self::task_succeeded) or
/// [`task_failed`](Self::task_failed) exactly once per attempt; duplicates
/// are tolerated and discarded by the engine.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<JobEvent>,
}

impl OrchestratorHandle {
    /// Report a successful analysis.
    pub async fn task_succeeded(
        &self,
        task_id: Uuid,
        findings: Vec<Finding>,
    ) -> SolguardResult<()> {
        self.send(JobEvent::TaskSucceeded { task_id, findings }).await
    }

    /// Report a failed analysis.
    pub async fn task_failed(
        &self,
        task_id: Uuid,
        reason: impl Into<String>,
    ) -> SolguardResult<()> {
        self.send(JobEvent::TaskFailed {
            task_id,
            reason: reason.into(),
        })
        .await
    }

    /// Request cancellation of a job.
    pub async fn cancel_job(&self, job_id: Uuid) -> SolguardResult<()> {
        self.send(JobEvent::CancelJob { job_id }).await
    }

    pub(crate) async fn send(&self, event: JobEvent) -> SolguardResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SolguardError::Orchestrator("engine event channel closed".to_string()))
    }
}

/// The job state machine engine.
///
/// Consumes [`JobEvent`]s from a bounded channel, advances job/task
/// state, releases agent load slots, and persists the aggregated report
/// when a job reaches a terminal state. A periodic sweep times out
/// overdue tasks and prunes stale agents.
pub struct Orchestrator {
    jobs: Arc<JobTable>,
    registry: Arc<AgentRegistry>,
    sink: Arc<dyn ResultsSink>,
    dispatcher: Arc<dyn TaskDispatcher>,
    events: Arc<EventLog>,
    rx: mpsc::Receiver<JobEvent>,
    task_timeout: Duration,
    sweep_interval: Duration,
    heartbeat_ttl: Duration,
}

impl Orchestrator {
    /// Create an engine and the handle feeding it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<JobTable>,
        registry: Arc<AgentRegistry>,
        sink: Arc<dyn ResultsSink>,
        dispatcher: Arc<dyn TaskDispatcher>,
        events: Arc<EventLog>,
        channel_capacity: usize,
        task_timeout: Duration,
        sweep_interval: Duration,
        heartbeat_ttl: Duration,
    ) -> (Self, OrchestratorHandle) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        (
            Self {
                jobs,
                registry,
                sink,
                dispatcher,
                events,
                rx,
                task_timeout,
                sweep_interval,
                heartbeat_ttl,
            },
            OrchestratorHandle { tx },
        )
    }

    /// Run the event loop until shutdown is signalled or every handle is
    /// dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("orchestrator engine started");
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("orchestrator engine stopped");
    }

    async fn handle_event(&self, event: JobEvent) {
        match event {
            JobEvent::JobRouted { job_id, tasks } => self.on_routed(job_id, tasks).await,
            JobEvent::RoutingFailed { job_id, reason } => {
                self.on_routing_failed(job_id, &reason).await;
            }
            JobEvent::TaskDispatched {
                task_id,
                agent_id,
                attempt,
            } => self.on_dispatched(task_id, &agent_id, attempt).await,
            JobEvent::TaskSucceeded { task_id, findings } => {
                self.on_result(task_id, TaskStatus::Succeeded, findings).await;
            }
            JobEvent::TaskFailed { task_id, reason } => {
                self.on_result(task_id, TaskStatus::Failed { reason }, Vec::new())
                    .await;
            }
            JobEvent::CancelJob { job_id } => self.on_cancel(job_id).await,
        }
    }

    async fn on_routed(&self, job_id: Uuid, tasks: Vec<Task>) {
        let task_count = tasks.len();
        match self.jobs.mark_routed(job_id, tasks).await {
            Some(job_terminal) => {
                info!(%job_id, tasks = task_count, "job routed");
                self.events.record(
                    EventKind::JobRouted,
                    job_id,
                    None,
                    None,
                    serde_json::json!({ "tasks": task_count }),
                );
                if job_terminal {
                    self.finalize(job_id).await;
                }
            }
            None => {
                warn!(%job_id, "routing notice for non-pending job ignored");
            }
        }
    }

    async fn on_routing_failed(&self, job_id: Uuid, reason: &str) {
        if self.jobs.mark_routing_failed(job_id, reason).await {
            warn!(%job_id, reason, "job failed routing");
            self.finalize(job_id).await;
        } else {
            warn!(%job_id, "routing failure for non-pending job ignored");
        }
    }

    async fn on_dispatched(&self, task_id: Uuid, agent_id: &str, attempt: u32) {
        let deadline = Utc::now()
            + ChronoDuration::from_std(self.task_timeout)
                .unwrap_or_else(|_| ChronoDuration::days(365));
        match self.jobs.mark_dispatched(task_id, attempt, deadline).await {
            Some((job_id, true)) => {
                self.events.record(
                    EventKind::TaskDispatched,
                    job_id,
                    Some(task_id),
                    Some(agent_id.to_string()),
                    serde_json::json!({ "attempt": attempt }),
                );
            }
            Some((_, false)) => {
                debug!(%task_id, "dispatch notice for terminal task ignored");
            }
            None => {
                warn!(%task_id, "dispatch notice for unknown task ignored");
            }
        }
    }

    async fn on_result(&self, task_id: Uuid, status: TaskStatus, findings: Vec<Finding>) {
        match self.jobs.apply_result(task_id, status.clone(), findings).await {
            ApplyOutcome::Applied {
                job_id,
                capability,
                job_terminal,
                released_agent,
            } => {
                if let Some(agent_id) = &released_agent {
                    self.registry.finish_dispatch(agent_id);
                }
                info!(%job_id, %task_id, %capability, status = ?status, "task terminal");
                self.events.record(
                    EventKind::TaskTerminal,
                    job_id,
                    Some(task_id),
                    released_agent,
                    serde_json::json!({
                        "capability": capability,
                        "status": status,
                    }),
                );
                if job_terminal {
                    self.finalize(job_id).await;
                }
            }
            ApplyOutcome::AlreadyTerminal { job_id } => {
                warn!(%job_id, %task_id, "duplicate result for terminal task discarded");
                self.events.record(
                    EventKind::DuplicateResult,
                    job_id,
                    Some(task_id),
                    None,
                    serde_json::json!({ "status": status }),
                );
            }
            ApplyOutcome::UnknownTask => {
                warn!(%task_id, "result for unknown task discarded");
            }
        }
    }

    async fn on_cancel(&self, job_id: Uuid) {
        match self.jobs.cancel(job_id).await {
            CancelOutcome::Cancelled { tasks } => {
                info!(%job_id, abandoned = tasks.len(), "job cancelled");
                for (task_id, agent_id) in tasks {
                    if let Some(agent_id) = agent_id {
                        self.dispatcher.abandon(&agent_id, task_id).await;
                        self.registry.finish_dispatch(&agent_id);
                    }
                }
                self.finalize(job_id).await;
            }
            CancelOutcome::AlreadyTerminal => {
                debug!(%job_id, "cancel for terminal job ignored");
            }
            CancelOutcome::Unknown => {
                warn!(%job_id, "cancel for unknown job ignored");
            }
        }
    }

    /// Time out overdue tasks and mark silent agents unreachable.
    async fn sweep(&self) {
        let expired = self.jobs.expire_overdue(Utc::now()).await;
        if !expired.is_empty() {
            let job_ids: Vec<Uuid> = expired.iter().map(|e| e.job_id).collect();
            for task in &expired {
                warn!(
                    job_id = %task.job_id,
                    task_id = %task.task_id,
                    capability = %task.capability,
                    "task timed out"
                );
                if let Some(agent_id) = &task.agent_id {
                    self.registry.finish_dispatch(agent_id);
                }
                self.events.record(
                    EventKind::TaskTerminal,
                    task.job_id,
                    Some(task.task_id),
                    task.agent_id.clone(),
                    serde_json::json!({
                        "capability": task.capability,
                        "status": "timed_out",
                    }),
                );
            }

            let mut terminal = self.jobs.terminal_jobs(job_ids).await;
            terminal.dedup();
            for job_id in terminal {
                self.finalize(job_id).await;
            }
        }

        let pruned = self.registry.prune_stale(self.heartbeat_ttl);
        if !pruned.is_empty() {
            warn!(agents = ?pruned, "agents marked unreachable by heartbeat sweep");
        }
    }

    /// Aggregate and persist the report of a terminal job.
    async fn finalize(&self, job_id: Uuid) {
        let Some(report) = self.jobs.build_report(job_id).await else {
            error!(%job_id, "terminal job has no record, report not persisted");
            return;
        };

        if let Err(e) = self.sink.persist(&report).await {
            // The job state stands; operators see the persistence gap in
            // the event stream.
            error!(%job_id, error = %e, "failed to persist report");
        }

        info!(
            %job_id,
            status = ?report.status,
            sections = report.sections.len(),
            "job terminal"
        );
        self.events.record(
            EventKind::JobTerminal,
            job_id,
            None,
            None,
            serde_json::json!({
                "status": report.status,
                "sections": report.sections.len(),
            }),
        );
    }
}
