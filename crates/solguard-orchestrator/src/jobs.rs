use chrono::{DateTime, Utc};
use solguard_core::{
    AnalysisReport, CapabilitySection, Capability, Finding, Job, JobStatus, Task, TaskOutcome,
    TaskStatus,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

struct TaskState {
    task: Task,
    findings: Vec<Finding>,
    deadline: Option<DateTime<Utc>>,
}

struct JobRecord {
    job: Job,
    /// Task states keyed by per-job sequence number, preserving the
    /// coordinator's creation order in the aggregated report.
    tasks: BTreeMap<u32, TaskState>,
}

struct Inner {
    jobs: HashMap<Uuid, JobRecord>,
    /// task id → (job id, seq).
    task_index: HashMap<Uuid, (Uuid, u32)>,
}

/// Result of applying a terminal task transition.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// The transition was applied.
    Applied {
        /// The parent job.
        job_id: Uuid,
        /// The task's capability, for event payloads.
        capability: Capability,
        /// Whether the job reached a terminal state with this transition.
        job_terminal: bool,
        /// The agent whose in-flight slot should be released, if any.
        released_agent: Option<String>,
    },
    /// The task is already terminal; the callback is a duplicate.
    AlreadyTerminal {
        /// The parent job.
        job_id: Uuid,
    },
    /// No task with this id exists.
    UnknownTask,
}

/// A task timed out by the deadline sweep.
#[derive(Debug)]
pub struct ExpiredTask {
    /// The task that expired.
    pub task_id: Uuid,
    /// Its parent job.
    pub job_id: Uuid,
    /// Its capability.
    pub capability: Capability,
    /// The agent whose slot should be released.
    pub agent_id: Option<String>,
}

/// Result of cancelling a job.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The job was cancelled; the listed tasks were non-terminal and are
    /// now `Cancelled` (task id, assigned agent).
    Cancelled {
        /// Tasks that were abandoned, with their assigned agents.
        tasks: Vec<(Uuid, Option<String>)>,
    },
    /// The job had already reached a terminal state.
    AlreadyTerminal,
    /// No job with this id exists.
    Unknown,
}

/// In-memory store of every job and its tasks.
///
/// The orchestrator engine is the single writer after routing; the
/// coordinator and the context only read (status checks, snapshots).
pub struct JobTable {
    inner: RwLock<Inner>,
}

impl JobTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                jobs: HashMap::new(),
                task_index: HashMap::new(),
            }),
        }
    }

    /// Insert a freshly submitted job.
    pub async fn insert(&self, job: Job) {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, JobRecord {
            job,
            tasks: BTreeMap::new(),
        });
    }

    /// Current status of a job.
    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        let inner = self.inner.read().await;
        inner.jobs.get(&job_id).map(|r| r.job.status.clone())
    }

    /// Snapshot of a job, with task ids in seq order.
    pub async fn snapshot(&self, job_id: Uuid) -> Option<Job> {
        let inner = self.inner.read().await;
        inner.jobs.get(&job_id).map(|r| r.job.clone())
    }

    /// Snapshot of a task.
    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        let inner = self.inner.read().await;
        let &(job_id, seq) = inner.task_index.get(&task_id)?;
        inner
            .jobs
            .get(&job_id)
            .and_then(|r| r.tasks.get(&seq))
            .map(|s| s.task.clone())
    }

    /// Attach the coordinator's derived tasks to a pending job.
    ///
    /// Returns `None` if the job is unknown or not `Pending` (redelivered
    /// duplicate), otherwise `Some(job_terminal)` — tasks born terminal
    /// (best-effort routing gaps) can finalize the job immediately.
    pub async fn mark_routed(&self, job_id: Uuid, tasks: Vec<Task>) -> Option<bool> {
        let mut inner = self.inner.write().await;
        let record = inner.jobs.get_mut(&job_id)?;
        if record.job.status != JobStatus::Pending {
            return None;
        }

        record.job.status = JobStatus::Routed;
        record.job.tasks = tasks.iter().map(|t| t.id).collect();
        let index_entries: Vec<(Uuid, (Uuid, u32))> =
            tasks.iter().map(|t| (t.id, (job_id, t.seq))).collect();
        for task in tasks {
            record.tasks.insert(task.seq, TaskState {
                task,
                findings: Vec::new(),
                deadline: None,
            });
        }
        recompute_status(record);
        let terminal = record.job.status.is_terminal();

        for (task_id, at) in index_entries {
            inner.task_index.insert(task_id, at);
        }
        Some(terminal)
    }

    /// Fail a pending job that could not be routed. Returns `false` for
    /// unknown or already-routed jobs.
    pub async fn mark_routing_failed(&self, job_id: Uuid, reason: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.jobs.get_mut(&job_id) else {
            return false;
        };
        if record.job.status != JobStatus::Pending {
            return false;
        }
        record.job.status = JobStatus::Failed {
            reason: reason.to_string(),
        };
        true
    }

    /// Record that a task was handed to its agent.
    ///
    /// Returns `Some((job_id, applied))`; `applied` is `false` when the
    /// task already reached a terminal state (the agent's callback can
    /// overtake the coordinator's dispatch notice).
    pub async fn mark_dispatched(
        &self,
        task_id: Uuid,
        attempt: u32,
        deadline: DateTime<Utc>,
    ) -> Option<(Uuid, bool)> {
        let mut inner = self.inner.write().await;
        let &(job_id, seq) = inner.task_index.get(&task_id)?;
        let record = inner.jobs.get_mut(&job_id)?;
        let state = record.tasks.get_mut(&seq)?;

        if state.task.status.is_terminal() {
            return Some((job_id, false));
        }
        state.task.status = TaskStatus::Dispatched;
        state.task.attempts = attempt;
        state.deadline = Some(deadline);
        recompute_status(record);
        Some((job_id, true))
    }

    /// Apply a terminal transition to a task (agent callback, dispatch
    /// exhaustion). Idempotent: a second terminal transition for the same
    /// task id reports [`ApplyOutcome::AlreadyTerminal`] and changes
    /// nothing.
    pub async fn apply_result(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        findings: Vec<Finding>,
    ) -> ApplyOutcome {
        debug_assert!(status.is_terminal());

        let mut inner = self.inner.write().await;
        let Some(&(job_id, seq)) = inner.task_index.get(&task_id) else {
            return ApplyOutcome::UnknownTask;
        };
        let Some(record) = inner.jobs.get_mut(&job_id) else {
            return ApplyOutcome::UnknownTask;
        };
        let Some(state) = record.tasks.get_mut(&seq) else {
            return ApplyOutcome::UnknownTask;
        };

        if state.task.status.is_terminal() {
            return ApplyOutcome::AlreadyTerminal { job_id };
        }

        let released_agent = state.task.assigned_agent.clone();
        let capability = state.task.capability;
        state.task.status = status;
        state.task.completed_at = Some(Utc::now());
        state.findings = findings;
        recompute_status(record);

        ApplyOutcome::Applied {
            job_id,
            capability,
            job_terminal: record.job.status.is_terminal(),
            released_agent,
        }
    }

    /// Time out every dispatched task whose deadline has passed.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<ExpiredTask> {
        let mut inner = self.inner.write().await;
        let mut expired = Vec::new();

        for record in inner.jobs.values_mut() {
            let mut touched = false;
            for state in record.tasks.values_mut() {
                let overdue = state.task.status == TaskStatus::Dispatched
                    && state.deadline.is_some_and(|d| d <= now);
                if overdue {
                    state.task.status = TaskStatus::TimedOut;
                    state.task.completed_at = Some(now);
                    touched = true;
                    expired.push(ExpiredTask {
                        task_id: state.task.id,
                        job_id: state.task.job_id,
                        capability: state.task.capability,
                        agent_id: state.task.assigned_agent.clone(),
                    });
                }
            }
            if touched {
                recompute_status(record);
            }
        }
        expired
    }

    /// Jobs that are currently in a terminal state.
    pub async fn terminal_jobs(&self, job_ids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
        let inner = self.inner.read().await;
        job_ids
            .into_iter()
            .filter(|id| {
                inner
                    .jobs
                    .get(id)
                    .is_some_and(|r| r.job.status.is_terminal())
            })
            .collect()
    }

    /// Cancel a job, marking its non-terminal tasks `Cancelled`.
    pub async fn cancel(&self, job_id: Uuid) -> CancelOutcome {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.jobs.get_mut(&job_id) else {
            return CancelOutcome::Unknown;
        };
        if record.job.status.is_terminal() {
            return CancelOutcome::AlreadyTerminal;
        }

        let now = Utc::now();
        let mut tasks = Vec::new();
        for state in record.tasks.values_mut() {
            if !state.task.status.is_terminal() {
                state.task.status = TaskStatus::Cancelled;
                state.task.completed_at = Some(now);
                tasks.push((state.task.id, state.task.assigned_agent.clone()));
            }
        }
        record.job.status = JobStatus::Cancelled;
        CancelOutcome::Cancelled { tasks }
    }

    /// Build the aggregated report for a job, sections in seq order.
    pub async fn build_report(&self, job_id: Uuid) -> Option<AnalysisReport> {
        let inner = self.inner.read().await;
        let record = inner.jobs.get(&job_id)?;

        let sections = record
            .tasks
            .values()
            .map(|state| CapabilitySection {
                capability: state.task.capability,
                agent_id: state.task.assigned_agent.clone(),
                outcome: match &state.task.status {
                    TaskStatus::Succeeded => TaskOutcome::Succeeded {
                        findings: state.findings.clone(),
                    },
                    TaskStatus::Failed { reason } => TaskOutcome::Failed {
                        reason: reason.clone(),
                    },
                    TaskStatus::TimedOut => TaskOutcome::TimedOut,
                    TaskStatus::Cancelled | TaskStatus::Queued | TaskStatus::Dispatched => {
                        TaskOutcome::Cancelled
                    }
                },
            })
            .collect();

        Some(AnalysisReport {
            job_id,
            status: record.job.status.clone(),
            sections,
            finished_at: Utc::now(),
        })
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Advance the job status from its tasks. Terminal job states are never
/// overwritten.
fn recompute_status(record: &mut JobRecord) {
    if record.job.status.is_terminal() || record.tasks.is_empty() {
        return;
    }

    let all_terminal = record
        .tasks
        .values()
        .all(|s| s.task.status.is_terminal());
    let any_terminal = record
        .tasks
        .values()
        .any(|s| s.task.status.is_terminal());
    let any_dispatched = record
        .tasks
        .values()
        .any(|s| s.task.status == TaskStatus::Dispatched);

    if all_terminal {
        let any_succeeded = record
            .tasks
            .values()
            .any(|s| s.task.status == TaskStatus::Succeeded);
        let all_cancelled = record
            .tasks
            .values()
            .all(|s| s.task.status == TaskStatus::Cancelled);
        record.job.status = if any_succeeded {
            JobStatus::Completed
        } else if all_cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed {
                reason: "all_tasks_failed".to_string(),
            }
        };
    } else if any_terminal
        && matches!(record.job.status, JobStatus::Running | JobStatus::Partial)
    {
        record.job.status = JobStatus::Partial;
    } else if any_dispatched && record.job.status == JobStatus::Routed {
        record.job.status = JobStatus::Running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solguard_core::AnalysisRequest;

    async fn routed_job(table: &JobTable, capabilities: &[Capability]) -> (Uuid, Vec<Uuid>) {
        let job = Job::new(AnalysisRequest::new("contract C {}"));
        let job_id = job.id;
        table.insert(job).await;

        let tasks: Vec<Task> = capabilities
            .iter()
            .enumerate()
            .map(|(seq, &cap)| {
                let mut task = Task::new(job_id, seq as u32, cap);
                task.assigned_agent = Some(format!("{cap}-1"));
                task
            })
            .collect();
        let task_ids = tasks.iter().map(|t| t.id).collect();
        assert_eq!(table.mark_routed(job_id, tasks).await, Some(false));
        (job_id, task_ids)
    }

    fn far_deadline() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(5)
    }

    #[tokio::test]
    async fn test_routing_moves_pending_to_routed() {
        let table = JobTable::new();
        let (job_id, _) = routed_job(&table, &[Capability::Static]).await;
        assert_eq!(table.status(job_id).await, Some(JobStatus::Routed));
    }

    #[tokio::test]
    async fn test_mark_routed_rejects_duplicate_routing() {
        let table = JobTable::new();
        let (job_id, _) = routed_job(&table, &[Capability::Static]).await;

        let again = Task::new(job_id, 0, Capability::Static);
        assert!(table.mark_routed(job_id, vec![again]).await.is_none());
    }

    #[tokio::test]
    async fn test_single_task_success_completes_job() {
        let table = JobTable::new();
        let (job_id, task_ids) = routed_job(&table, &[Capability::Static]).await;

        table
            .mark_dispatched(task_ids[0], 1, far_deadline())
            .await
            .unwrap();
        assert_eq!(table.status(job_id).await, Some(JobStatus::Running));

        let outcome = table
            .apply_result(task_ids[0], TaskStatus::Succeeded, vec![])
            .await;
        match outcome {
            ApplyOutcome::Applied {
                job_terminal,
                released_agent,
                ..
            } => {
                assert!(job_terminal);
                assert_eq!(released_agent.as_deref(), Some("static-1"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(table.status(job_id).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_partial_then_completed() {
        let table = JobTable::new();
        let (job_id, task_ids) =
            routed_job(&table, &[Capability::Static, Capability::Dynamic]).await;

        for &task_id in &task_ids {
            table.mark_dispatched(task_id, 1, far_deadline()).await;
        }
        table
            .apply_result(task_ids[0], TaskStatus::Succeeded, vec![])
            .await;
        assert_eq!(table.status(job_id).await, Some(JobStatus::Partial));

        table
            .apply_result(
                task_ids[1],
                TaskStatus::Failed {
                    reason: "fuzzer crashed".into(),
                },
                vec![],
            )
            .await;
        // One success is enough for completion.
        assert_eq!(table.status(job_id).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_all_failed_fails_job() {
        let table = JobTable::new();
        let (job_id, task_ids) = routed_job(&table, &[Capability::Static]).await;

        table.mark_dispatched(task_ids[0], 1, far_deadline()).await;
        table
            .apply_result(
                task_ids[0],
                TaskStatus::Failed {
                    reason: "boom".into(),
                },
                vec![],
            )
            .await;
        assert_eq!(
            table.status(job_id).await,
            Some(JobStatus::Failed {
                reason: "all_tasks_failed".into()
            })
        );
    }

    #[tokio::test]
    async fn test_duplicate_result_is_not_reapplied() {
        let table = JobTable::new();
        let (job_id, task_ids) = routed_job(&table, &[Capability::Static]).await;

        table.mark_dispatched(task_ids[0], 1, far_deadline()).await;
        table
            .apply_result(task_ids[0], TaskStatus::Succeeded, vec![])
            .await;

        let report_before = table.build_report(job_id).await.unwrap();

        let duplicate = table
            .apply_result(
                task_ids[0],
                TaskStatus::Failed {
                    reason: "late".into(),
                },
                vec![],
            )
            .await;
        assert!(matches!(duplicate, ApplyOutcome::AlreadyTerminal { .. }));

        let report_after = table.build_report(job_id).await.unwrap();
        assert_eq!(report_before.sections, report_after.sections);
        assert_eq!(table.status(job_id).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_result_before_dispatch_notice() {
        let table = JobTable::new();
        let (job_id, task_ids) = routed_job(&table, &[Capability::Static]).await;

        // The agent's callback overtakes the coordinator's notice.
        let outcome = table
            .apply_result(task_ids[0], TaskStatus::Succeeded, vec![])
            .await;
        assert!(matches!(
            outcome,
            ApplyOutcome::Applied {
                released_agent: Some(_),
                ..
            }
        ));

        let (_, applied) = table
            .mark_dispatched(task_ids[0], 1, far_deadline())
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(table.status(job_id).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_unknown_task_result() {
        let table = JobTable::new();
        let outcome = table
            .apply_result(Uuid::new_v4(), TaskStatus::Succeeded, vec![])
            .await;
        assert!(matches!(outcome, ApplyOutcome::UnknownTask));
    }

    #[tokio::test]
    async fn test_expire_overdue_times_out_dispatched_tasks() {
        let table = JobTable::new();
        let (job_id, task_ids) = routed_job(&table, &[Capability::Static]).await;

        let past = Utc::now() - chrono::Duration::seconds(1);
        table.mark_dispatched(task_ids[0], 1, past).await;

        let expired = table.expire_overdue(Utc::now()).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id, task_ids[0]);
        assert_eq!(expired[0].agent_id.as_deref(), Some("static-1"));
        assert_eq!(
            table.status(job_id).await,
            Some(JobStatus::Failed {
                reason: "all_tasks_failed".into()
            })
        );

        // Queued tasks never expire.
        assert!(table.expire_overdue(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_marks_remaining_tasks() {
        let table = JobTable::new();
        let (job_id, task_ids) =
            routed_job(&table, &[Capability::Static, Capability::Dynamic]).await;

        table.mark_dispatched(task_ids[0], 1, far_deadline()).await;
        table
            .apply_result(task_ids[0], TaskStatus::Succeeded, vec![])
            .await;

        match table.cancel(job_id).await {
            CancelOutcome::Cancelled { tasks } => {
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].0, task_ids[1]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(table.status(job_id).await, Some(JobStatus::Cancelled));

        // Cancelling again is a no-op.
        assert!(matches!(
            table.cancel(job_id).await,
            CancelOutcome::AlreadyTerminal
        ));
    }

    #[tokio::test]
    async fn test_report_sections_follow_seq_order_and_keep_failures() {
        let table = JobTable::new();
        let (job_id, task_ids) =
            routed_job(&table, &[Capability::Static, Capability::Dynamic]).await;

        // Complete out of order.
        table.mark_dispatched(task_ids[1], 1, far_deadline()).await;
        table
            .apply_result(
                task_ids[1],
                TaskStatus::Failed {
                    reason: "fuzzer crashed".into(),
                },
                vec![],
            )
            .await;
        table.mark_dispatched(task_ids[0], 1, far_deadline()).await;
        table
            .apply_result(
                task_ids[0],
                TaskStatus::Succeeded,
                vec![Finding::new(
                    solguard_core::Severity::High,
                    "Reentrancy",
                    "External call before state update",
                )],
            )
            .await;

        let report = table.build_report(job_id).await.unwrap();
        assert_eq!(report.sections.len(), 2);
        assert_eq!(report.sections[0].capability, Capability::Static);
        assert!(matches!(
            report.sections[0].outcome,
            TaskOutcome::Succeeded { .. }
        ));
        assert_eq!(report.sections[1].capability, Capability::Dynamic);
        assert!(matches!(report.sections[1].outcome, TaskOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_stillborn_tasks_can_finalize_on_routing() {
        let table = JobTable::new();
        let job = Job::new(AnalysisRequest::new("contract C {}"));
        let job_id = job.id;
        table.insert(job).await;

        let mut task = Task::new(job_id, 0, Capability::Ml);
        task.status = TaskStatus::Failed {
            reason: "no_capable_agent".into(),
        };
        assert_eq!(table.mark_routed(job_id, vec![task]).await, Some(true));
        assert!(matches!(
            table.status(job_id).await,
            Some(JobStatus::Failed { .. })
        ));
    }
}
