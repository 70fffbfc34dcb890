use crate::config::OrchestratorConfig;
use crate::coordinator::Coordinator;
use crate::dispatch::{AgentDirective, ChannelDispatcher, TaskDispatcher};
use crate::engine::{JobEvent, Orchestrator, OrchestratorHandle};
use crate::events::{EventKind, EventLog};
use crate::jobs::JobTable;
use crate::pipelines::PipelineTable;
use solguard_core::{
    AnalysisReport, AnalysisRequest, Job, JobStatus, SolguardError, SolguardResult,
};
use solguard_queue::JobQueue;
use solguard_registry::{AgentDescriptor, AgentRegistry};
use solguard_sink::ResultsSink;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// The per-process orchestration context.
///
/// Owns the wiring between queue, registry, engine, coordinator workers,
/// and sink — all injected, so there is no hidden global state. This is
/// the surface the HTTP layer calls: submit, status, report, cancel.
pub struct OrchestrationContext {
    queue: Arc<dyn JobQueue>,
    registry: Arc<AgentRegistry>,
    sink: Arc<dyn ResultsSink>,
    jobs: Arc<JobTable>,
    dispatcher: Arc<ChannelDispatcher>,
    events: Arc<EventLog>,
    handle: OrchestratorHandle,
    pipelines: PipelineTable,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OrchestrationContext {
    /// Construct the context and spawn the engine plus the configured
    /// number of coordinator workers.
    pub fn start(
        config: OrchestratorConfig,
        queue: Arc<dyn JobQueue>,
        registry: Arc<AgentRegistry>,
        sink: Arc<dyn ResultsSink>,
    ) -> Self {
        let events = Arc::new(match &config.event_log_dir {
            Some(dir) => EventLog::new(dir.clone()),
            None => EventLog::disabled(),
        });
        let jobs = Arc::new(JobTable::new());
        let dispatcher = Arc::new(ChannelDispatcher::new(config.channel_capacity));

        let (engine, handle) = Orchestrator::new(
            Arc::clone(&jobs),
            Arc::clone(&registry),
            Arc::clone(&sink),
            Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
            Arc::clone(&events),
            config.channel_capacity,
            config.task_timeout(),
            config.sweep_interval(),
            config.heartbeat_ttl(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(config.coordinator_workers + 1);
        workers.push(tokio::spawn(engine.run(shutdown_rx.clone())));

        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&jobs),
            Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
            handle.clone(),
            &config,
        ));
        for _ in 0..config.coordinator_workers.max(1) {
            workers.push(tokio::spawn(
                Arc::clone(&coordinator).run(shutdown_rx.clone()),
            ));
        }

        info!(
            workers = config.coordinator_workers.max(1),
            "orchestration context started"
        );

        Self {
            queue,
            registry,
            sink,
            jobs,
            dispatcher,
            events,
            handle,
            pipelines: config.pipeline_table(),
            shutdown: shutdown_tx,
            workers: Mutex::new(workers),
        }
    }

    /// Submit an analysis request. The job is registered, enqueued, and
    /// routed asynchronously; the returned id is the key for status and
    /// report lookups.
    pub async fn submit(&self, request: AnalysisRequest) -> SolguardResult<Uuid> {
        if self.pipelines.resolve(&request.pipeline).is_none() {
            return Err(SolguardError::Config(format!(
                "unknown pipeline '{}'",
                request.pipeline
            )));
        }

        let job = Job::new(request);
        let job_id = job.id;
        self.jobs.insert(job.clone()).await;
        self.events.record(
            EventKind::JobSubmitted,
            job_id,
            None,
            None,
            serde_json::json!({ "pipeline": job.request.pipeline }),
        );
        self.queue.enqueue(job).await?;
        Ok(job_id)
    }

    /// Current status of a job.
    pub async fn job_status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs.status(job_id).await
    }

    /// Snapshot of a job with its task ids.
    pub async fn job(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.snapshot(job_id).await
    }

    /// The persisted report of a terminal job, if any.
    pub async fn report(&self, job_id: Uuid) -> SolguardResult<Option<AnalysisReport>> {
        self.sink.fetch(job_id).await
    }

    /// Cancel a job: drop it from the queue if still waiting, and have
    /// the engine abandon whatever is in flight.
    pub async fn cancel(&self, job_id: Uuid) -> SolguardResult<()> {
        let dequeued = self.queue.cancel(job_id).await?;
        if dequeued {
            info!(%job_id, "job removed from queue before routing");
        }
        self.handle.send(JobEvent::CancelJob { job_id }).await
    }

    /// Register an agent and open its input channel in one step.
    ///
    /// The returned receiver is the agent's mailbox of
    /// [`AgentDirective`]s; results go back through [`handle`](Self::handle).
    pub fn attach_agent(
        &self,
        descriptor: AgentDescriptor,
    ) -> mpsc::Receiver<AgentDirective> {
        let agent_id = descriptor.id.clone();
        self.registry.register(descriptor);
        self.dispatcher.attach(agent_id)
    }

    /// The callback handle agents use to report results.
    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    /// The agent registry (heartbeats, health introspection).
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Stop the coordinator workers and the engine, waiting for them to
    /// drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let workers = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
        info!("orchestration context stopped");
    }
}
