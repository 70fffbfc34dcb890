use crate::config::OrchestratorConfig;
use crate::dispatch::{RetryPolicy, TaskAssignment, TaskDispatcher};
use crate::engine::{JobEvent, OrchestratorHandle};
use crate::jobs::JobTable;
use crate::pipelines::{PipelineTable, RoutingPolicy};
use solguard_core::{Job, JobStatus, SolguardResult, Task, TaskStatus};
use solguard_queue::{JobQueue, LeaseToken};
use solguard_registry::AgentRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of a single routing pass, for tests and worker backoff.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No job was visible in the queue.
    Idle,
    /// The job was routed and its tasks dispatched.
    Routed {
        /// The routed job.
        job_id: Uuid,
        /// Number of tasks actually handed to an agent.
        dispatched: usize,
    },
    /// The job failed routing and was acknowledged.
    Rejected {
        /// The rejected job.
        job_id: Uuid,
        /// Failure reason recorded on the job.
        reason: String,
    },
    /// A redelivered job was already routed; acknowledged and skipped.
    Duplicate {
        /// The job id.
        job_id: Uuid,
    },
}

/// Routes jobs from the queue into per-capability tasks and dispatches
/// each to an agent selected through the registry.
///
/// Multiple coordinator workers may drain the same queue; redelivered
/// jobs are deduplicated against the job table by id.
pub struct Coordinator {
    queue: Arc<dyn JobQueue>,
    registry: Arc<AgentRegistry>,
    jobs: Arc<JobTable>,
    dispatcher: Arc<dyn TaskDispatcher>,
    handle: OrchestratorHandle,
    pipelines: PipelineTable,
    routing: RoutingPolicy,
    retry: RetryPolicy,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl Coordinator {
    /// Wire a coordinator from its collaborators and config.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<AgentRegistry>,
        jobs: Arc<JobTable>,
        dispatcher: Arc<dyn TaskDispatcher>,
        handle: OrchestratorHandle,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            jobs,
            dispatcher,
            handle,
            pipelines: config.pipeline_table(),
            routing: config.routing,
            retry: config.retry.clone(),
            visibility_timeout: config.visibility_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Lease and process at most one job.
    pub async fn run_once(&self) -> SolguardResult<RouteOutcome> {
        match self.queue.lease(self.visibility_timeout).await? {
            Some((job, token)) => self.process(job, token).await,
            None => Ok(RouteOutcome::Idle),
        }
    }

    /// Drain the queue until shutdown is signalled.
    ///
    /// Queue errors are retried with capped exponential backoff; a single
    /// job's routing failure never stops the worker.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut consecutive_errors: u32 = 0;
        info!("coordinator worker started");
        loop {
            let leased = tokio::select! {
                _ = shutdown.changed() => break,
                leased = self
                    .queue
                    .lease_wait(self.visibility_timeout, self.poll_interval) => leased,
            };

            match leased {
                Ok((job, token)) => {
                    consecutive_errors = 0;
                    if let Err(e) = self.process(job, token).await {
                        error!(error = %e, "routing pass failed");
                    }
                }
                Err(e) => {
                    let delay = self.retry.backoff_ms(consecutive_errors);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    error!(error = %e, delay_ms = delay, "queue unavailable, backing off");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
        info!("coordinator worker stopped");
    }

    async fn process(&self, job: Job, token: LeaseToken) -> SolguardResult<RouteOutcome> {
        let job_id = job.id;

        // At-least-once delivery: a redelivered job that is already past
        // Pending was routed by an earlier lease.
        match self.jobs.status(job_id).await {
            None => self.jobs.insert(job.clone()).await,
            Some(JobStatus::Pending) => {}
            Some(_) => {
                self.ack(token).await;
                info!(%job_id, "redelivered job already routed, skipping");
                return Ok(RouteOutcome::Duplicate { job_id });
            }
        }

        let Some(capabilities) = self.pipelines.resolve(&job.request.pipeline) else {
            warn!(%job_id, pipeline = %job.request.pipeline, "unknown pipeline");
            return self.reject(job_id, token, "unknown_pipeline").await;
        };

        // Selection phase: pick an agent per capability up front so an
        // all-or-nothing failure dispatches nothing.
        let mut selected: Vec<Option<String>> = Vec::with_capacity(capabilities.len());
        for &capability in capabilities {
            match self.registry.select(capability) {
                Ok(agent_id) => {
                    self.registry.begin_dispatch(&agent_id);
                    selected.push(Some(agent_id));
                }
                Err(_) if self.routing == RoutingPolicy::BestEffort => {
                    warn!(%job_id, %capability, "no capable agent, continuing best-effort");
                    selected.push(None);
                }
                Err(e) => {
                    warn!(%job_id, %capability, error = %e, "no capable agent, failing job");
                    self.release(&selected);
                    return self.reject(job_id, token, "no_capable_agent").await;
                }
            }
        }

        if selected.iter().all(Option::is_none) {
            return self.reject(job_id, token, "no_capable_agent").await;
        }

        // Build the task set: tasks without an agent are terminal from
        // birth so the report still shows the gap.
        let mut tasks = Vec::with_capacity(capabilities.len());
        for (seq, (&capability, agent)) in capabilities.iter().zip(&selected).enumerate() {
            let mut task = Task::new(job_id, seq as u32, capability);
            match agent {
                Some(agent_id) => task.assigned_agent = Some(agent_id.clone()),
                None => {
                    task.status = TaskStatus::Failed {
                        reason: "no_capable_agent".to_string(),
                    };
                    task.completed_at = Some(chrono::Utc::now());
                }
            }
            tasks.push(task);
        }

        self.handle
            .send(JobEvent::JobRouted {
                job_id,
                tasks: tasks.clone(),
            })
            .await?;

        let mut dispatched = 0;
        for task in &tasks {
            let Some(agent_id) = &task.assigned_agent else {
                continue;
            };
            match self.dispatch_with_retry(task, &job, agent_id).await {
                Ok(attempt) => {
                    self.handle
                        .send(JobEvent::TaskDispatched {
                            task_id: task.id,
                            agent_id: agent_id.clone(),
                            attempt,
                        })
                        .await?;
                    dispatched += 1;
                }
                Err(e) => {
                    warn!(
                        %job_id,
                        task_id = %task.id,
                        %agent_id,
                        error = %e,
                        "dispatch exhausted, failing task"
                    );
                    self.handle
                        .send(JobEvent::TaskFailed {
                            task_id: task.id,
                            reason: "dispatch_failed".to_string(),
                        })
                        .await?;
                }
            }
        }

        self.ack(token).await;
        info!(%job_id, dispatched, "job routed and acknowledged");
        Ok(RouteOutcome::Routed { job_id, dispatched })
    }

    /// Hand the assignment to the agent, retrying transient failures with
    /// exponential backoff. Returns the 1-based attempt that succeeded.
    async fn dispatch_with_retry(
        &self,
        task: &Task,
        job: &Job,
        agent_id: &str,
    ) -> SolguardResult<u32> {
        let mut attempt = 0;
        loop {
            let assignment = TaskAssignment::new(task, job, attempt + 1);
            match self.dispatcher.dispatch(agent_id, assignment).await {
                Ok(()) => return Ok(attempt + 1),
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff_ms(attempt);
                    warn!(
                        task_id = %task.id,
                        %agent_id,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "dispatch failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fail the job's routing and acknowledge the lease so it is not
    /// redelivered into the same dead end.
    async fn reject(
        &self,
        job_id: Uuid,
        token: LeaseToken,
        reason: &str,
    ) -> SolguardResult<RouteOutcome> {
        self.handle
            .send(JobEvent::RoutingFailed {
                job_id,
                reason: reason.to_string(),
            })
            .await?;
        self.ack(token).await;
        Ok(RouteOutcome::Rejected {
            job_id,
            reason: reason.to_string(),
        })
    }

    /// Release load slots taken during a selection phase that was
    /// abandoned.
    fn release(&self, selected: &[Option<String>]) {
        for agent_id in selected.iter().flatten() {
            self.registry.finish_dispatch(agent_id);
        }
    }

    /// Acknowledge a lease, tolerating expiry (the duplicate guard
    /// absorbs the redelivery).
    async fn ack(&self, token: LeaseToken) {
        if let Err(e) = self.queue.ack(token).await {
            warn!(error = %e, "lease ack failed, expecting redelivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ChannelDispatcher;
    use crate::events::EventLog;
    use crate::jobs::JobTable;
    use async_trait::async_trait;
    use solguard_core::{AnalysisRequest, Capability, SolguardError};
    use solguard_queue::MemoryQueue;
    use solguard_registry::AgentDescriptor;
    use solguard_sink::{MemorySink, ResultsSink};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct Rig {
        queue: Arc<MemoryQueue>,
        registry: Arc<AgentRegistry>,
        jobs: Arc<JobTable>,
        dispatcher: Arc<ChannelDispatcher>,
        coordinator: Coordinator,
        _shutdown: watch::Sender<bool>,
    }

    /// Wire a coordinator against a live engine so routed jobs actually
    /// land in the job table.
    fn rig(config: OrchestratorConfig) -> Rig {
        let queue = Arc::new(MemoryQueue::new());
        let registry = Arc::new(AgentRegistry::new());
        let jobs = Arc::new(JobTable::new());
        let dispatcher = Arc::new(ChannelDispatcher::new(8));
        let sink = Arc::new(MemorySink::new()) as Arc<dyn ResultsSink>;
        let events = Arc::new(EventLog::disabled());

        let (engine, handle) = crate::engine::Orchestrator::new(
            Arc::clone(&jobs),
            Arc::clone(&registry),
            sink,
            Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
            events,
            16,
            config.task_timeout(),
            config.sweep_interval(),
            config.heartbeat_ttl(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(engine.run(shutdown_rx));

        let coordinator = Coordinator::new(
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::clone(&registry),
            Arc::clone(&jobs),
            Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
            handle,
            &config,
        );

        Rig {
            queue,
            registry,
            jobs,
            dispatcher,
            coordinator,
            _shutdown: shutdown_tx,
        }
    }

    async fn wait_for_status(rig: &Rig, job_id: Uuid, wanted: impl Fn(&JobStatus) -> bool) {
        for _ in 0..100 {
            if let Some(status) = rig.jobs.status(job_id).await {
                if wanted(&status) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached the wanted status");
    }

    async fn submit(rig: &Rig, pipeline: &str) -> Uuid {
        let job = Job::new(AnalysisRequest::new("contract C {}").with_pipeline(pipeline));
        let job_id = job.id;
        rig.jobs.insert(job.clone()).await;
        rig.queue.enqueue(job).await.unwrap()
    }

    #[tokio::test]
    async fn test_idle_on_empty_queue() {
        let rig = rig(OrchestratorConfig::default());
        assert_eq!(rig.coordinator.run_once().await.unwrap(), RouteOutcome::Idle);
    }

    #[tokio::test]
    async fn test_quick_pipeline_dispatches_one_task() {
        let rig = rig(OrchestratorConfig::default());
        rig.registry
            .register(AgentDescriptor::new("static-1", vec![Capability::Static]));
        let mut agent_rx = rig.dispatcher.attach("static-1");

        let job_id = submit(&rig, "quick").await;
        let outcome = rig.coordinator.run_once().await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Routed {
                job_id,
                dispatched: 1
            }
        );

        // The agent received exactly one assignment.
        let directive = agent_rx.recv().await.unwrap();
        match directive {
            crate::dispatch::AgentDirective::Run(assignment) => {
                assert_eq!(assignment.job_id, job_id);
                assert_eq!(assignment.capability, Capability::Static);
                assert_eq!(assignment.attempt, 1);
            }
            other => panic!("unexpected directive: {other:?}"),
        }
        assert!(agent_rx.try_recv().is_err());

        // The lease was acknowledged: nothing left to lease.
        assert_eq!(rig.queue.depth().await, 0);
        wait_for_status(&rig, job_id, |s| *s == JobStatus::Running).await;

        // Selection counted the in-flight task.
        assert_eq!(rig.registry.snapshot()[0].load, 1);
    }

    #[tokio::test]
    async fn test_all_or_nothing_missing_capability_fails_job() {
        let rig = rig(OrchestratorConfig::default());
        rig.registry
            .register(AgentDescriptor::new("static-1", vec![Capability::Static]));
        rig.registry
            .register(AgentDescriptor::new("dynamic-1", vec![Capability::Dynamic]));
        let mut static_rx = rig.dispatcher.attach("static-1");
        let mut dynamic_rx = rig.dispatcher.attach("dynamic-1");

        let job_id = submit(&rig, "deep").await;
        let outcome = rig.coordinator.run_once().await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Rejected {
                job_id,
                reason: "no_capable_agent".into()
            }
        );

        wait_for_status(&rig, job_id, |s| {
            *s == JobStatus::Failed {
                reason: "no_capable_agent".into(),
            }
        })
        .await;

        // Nothing was dispatched to the available agents.
        assert!(static_rx.try_recv().is_err());
        assert!(dynamic_rx.try_recv().is_err());

        // The selection-phase load increments were rolled back.
        for agent in rig.registry.snapshot() {
            assert_eq!(agent.load, 0);
        }
    }

    #[tokio::test]
    async fn test_best_effort_dispatches_available_subset() {
        let config = OrchestratorConfig {
            routing: RoutingPolicy::BestEffort,
            ..OrchestratorConfig::default()
        };
        let rig = rig(config);
        rig.registry
            .register(AgentDescriptor::new("static-1", vec![Capability::Static]));
        rig.registry
            .register(AgentDescriptor::new("dynamic-1", vec![Capability::Dynamic]));
        let mut static_rx = rig.dispatcher.attach("static-1");
        let mut dynamic_rx = rig.dispatcher.attach("dynamic-1");

        let job_id = submit(&rig, "deep").await;
        let outcome = rig.coordinator.run_once().await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Routed {
                job_id,
                dispatched: 2
            }
        );

        assert!(static_rx.recv().await.is_some());
        assert!(dynamic_rx.recv().await.is_some());

        // The routed job carries three tasks; the ml one is stillborn.
        wait_for_status(&rig, job_id, |s| !matches!(s, JobStatus::Pending)).await;
        let job = rig.jobs.snapshot(job_id).await.unwrap();
        assert_eq!(job.tasks.len(), 3);
        let ml_task = rig.jobs.task(job.tasks[2]).await.unwrap();
        assert_eq!(ml_task.capability, Capability::Ml);
        assert!(ml_task.status.is_terminal());
    }

    #[tokio::test]
    async fn test_best_effort_with_no_agents_rejects() {
        let config = OrchestratorConfig {
            routing: RoutingPolicy::BestEffort,
            ..OrchestratorConfig::default()
        };
        let rig = rig(config);

        let job_id = submit(&rig, "quick").await;
        let outcome = rig.coordinator.run_once().await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Rejected {
                job_id,
                reason: "no_capable_agent".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_pipeline_rejects() {
        let rig = rig(OrchestratorConfig::default());
        let job_id = submit(&rig, "nonexistent").await;

        let outcome = rig.coordinator.run_once().await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Rejected {
                job_id,
                reason: "unknown_pipeline".into()
            }
        );
        wait_for_status(&rig, job_id, |s| matches!(s, JobStatus::Failed { .. })).await;
    }

    #[tokio::test]
    async fn test_redelivered_job_is_skipped() {
        let rig = rig(OrchestratorConfig::default());
        rig.registry
            .register(AgentDescriptor::new("static-1", vec![Capability::Static]));
        let _agent_rx = rig.dispatcher.attach("static-1");

        let job_id = submit(&rig, "quick").await;
        rig.coordinator.run_once().await.unwrap();
        wait_for_status(&rig, job_id, |s| !matches!(s, JobStatus::Pending)).await;

        // Simulate lease-expiry redelivery of the same job.
        let job = rig.jobs.snapshot(job_id).await.unwrap();
        rig.queue.enqueue(job).await.unwrap();

        let outcome = rig.coordinator.run_once().await.unwrap();
        assert_eq!(outcome, RouteOutcome::Duplicate { job_id });
        assert_eq!(rig.queue.depth().await, 0);
    }

    /// Dispatcher that fails a configurable number of times before
    /// accepting.
    struct FlakyDispatcher {
        failures: AtomicU32,
        tx: mpsc::UnboundedSender<TaskAssignment>,
    }

    #[async_trait]
    impl TaskDispatcher for FlakyDispatcher {
        async fn dispatch(
            &self,
            _agent_id: &str,
            assignment: TaskAssignment,
        ) -> SolguardResult<()> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                v.checked_sub(1)
            })
            .is_ok()
            {
                return Err(SolguardError::Dispatch("send failed".into()));
            }
            let _ = self.tx.send(assignment);
            Ok(())
        }

        async fn abandon(&self, _agent_id: &str, _task_id: Uuid) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_dispatch_failures_are_retried() {
        let (tx, mut delivered) = mpsc::unbounded_channel();
        let flaky = Arc::new(FlakyDispatcher {
            failures: AtomicU32::new(2),
            tx,
        });

        let config = OrchestratorConfig::default();
        let queue = Arc::new(MemoryQueue::new()) as Arc<dyn JobQueue>;
        let registry = Arc::new(AgentRegistry::new());
        let jobs = Arc::new(JobTable::new());
        let sink = Arc::new(MemorySink::new()) as Arc<dyn ResultsSink>;
        let events = Arc::new(EventLog::disabled());
        let (engine, handle) = crate::engine::Orchestrator::new(
            Arc::clone(&jobs),
            Arc::clone(&registry),
            sink,
            Arc::clone(&flaky) as Arc<dyn TaskDispatcher>,
            events,
            16,
            config.task_timeout(),
            config.sweep_interval(),
            config.heartbeat_ttl(),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(engine.run(shutdown_rx));

        registry.register(AgentDescriptor::new("static-1", vec![Capability::Static]));
        let coordinator = Coordinator::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&jobs),
            flaky as Arc<dyn TaskDispatcher>,
            handle,
            &config,
        );

        let job = Job::new(AnalysisRequest::new("contract C {}").with_pipeline("quick"));
        let job_id = job.id;
        jobs.insert(job.clone()).await;
        queue.enqueue(job).await.unwrap();

        let outcome = coordinator.run_once().await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Routed {
                job_id,
                dispatched: 1
            }
        );

        // Two failed sends, third attempt delivered.
        let assignment = delivered.recv().await.unwrap();
        assert_eq!(assignment.attempt, 3);
    }
}
