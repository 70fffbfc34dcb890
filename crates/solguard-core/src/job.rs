use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An analysis type a specialized agent can perform.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Source-level static analysis (linters, symbolic execution).
    Static,
    /// Dynamic analysis against a deployed or simulated contract (fuzzing).
    Dynamic,
    /// Model-based vulnerability scoring.
    Ml,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Static => write!(f, "static"),
            Capability::Dynamic => write!(f, "dynamic"),
            Capability::Ml => write!(f, "ml"),
        }
    }
}

fn default_pipeline() -> String {
    "standard".to_string()
}

/// A client-submitted request: one contract under one named pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Solidity source of the contract under analysis.
    pub contract_source: String,
    /// On-chain address, when the contract is already deployed.
    #[serde(default)]
    pub contract_address: Option<String>,
    /// Chain the address lives on.
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// Named pipeline selecting the required capability set.
    #[serde(default = "default_pipeline")]
    pub pipeline: String,
}

impl AnalysisRequest {
    /// Create a request for the default (`standard`) pipeline.
    pub fn new(contract_source: impl Into<String>) -> Self {
        Self {
            contract_source: contract_source.into(),
            contract_address: None,
            chain_id: None,
            pipeline: default_pipeline(),
        }
    }

    /// Select a named pipeline.
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = pipeline.into();
        self
    }

    /// Attach the deployed address and chain of the contract.
    pub fn with_deployment(mut self, address: impl Into<String>, chain_id: u64) -> Self {
        self.contract_address = Some(address.into());
        self.chain_id = Some(chain_id);
        self
    }
}

/// Lifecycle state of a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, not yet picked up by a coordinator.
    Pending,
    /// The coordinator has derived at least one task.
    Routed,
    /// At least one task is dispatched to an agent.
    Running,
    /// Some tasks are terminal while others are still in flight.
    Partial,
    /// All tasks terminal and at least one succeeded.
    Completed,
    /// Routing failed, or every task failed.
    Failed {
        /// User-visible failure reason (e.g. `no_capable_agent`).
        reason: String,
    },
    /// Cancelled by the client before completion.
    Cancelled,
}

impl JobStatus {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }
}

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created by the coordinator, not yet handed to an agent.
    Queued,
    /// Handed to exactly one agent; awaiting its callback.
    Dispatched,
    /// The agent reported success.
    Succeeded,
    /// The agent reported failure, or dispatch was exhausted.
    Failed {
        /// Failure reason as reported by the agent or the dispatcher.
        reason: String,
    },
    /// No callback arrived before the task deadline.
    TimedOut,
    /// Abandoned because the parent job was cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Failed { .. }
                | TaskStatus::TimedOut
                | TaskStatus::Cancelled
        )
    }
}

/// A client-submitted analysis job.
///
/// Owned by the orchestrator engine; mutated only in response to
/// coordinator and agent events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id; also the key under which results are persisted.
    pub id: Uuid,
    /// The submitted payload.
    pub request: AnalysisRequest,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Ids of the tasks derived from this job, in dispatch order.
    #[serde(default)]
    pub tasks: Vec<Uuid>,
}

impl Job {
    /// Create a pending job for the given request.
    pub fn new(request: AnalysisRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            tasks: Vec::new(),
        }
    }
}

/// One capability-specific unit of work derived from a [`Job`].
///
/// Retries bump `attempts`; they never mint a new task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id, stable across dispatch retries.
    pub id: Uuid,
    /// The job this task was derived from.
    pub job_id: Uuid,
    /// Creation order within the job; the orchestrator reports sections in
    /// this order regardless of completion order.
    pub seq: u32,
    /// The capability this task requires.
    pub capability: Capability,
    /// The agent the task is currently assigned to, once dispatched.
    pub assigned_agent: Option<String>,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Number of dispatch attempts made so far.
    pub attempts: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a queued task for one capability of a job.
    pub fn new(job_id: Uuid, seq: u32, capability: Capability) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            seq,
            capability,
            assigned_agent: None,
            status: TaskStatus::Queued,
            attempts: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
