use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use solguard_core::{Capability, Job, SolguardError, SolguardResult, Task};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// The unit of work handed to an agent's input channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Task id; agents echo it in their result callback.
    pub task_id: Uuid,
    /// Parent job id.
    pub job_id: Uuid,
    /// The capability the agent should exercise.
    pub capability: Capability,
    /// Solidity source under analysis.
    pub contract_source: String,
    /// Deployed address, when known.
    pub contract_address: Option<String>,
    /// Chain the address lives on.
    pub chain_id: Option<u64>,
    /// Dispatch attempt number, 1-based.
    pub attempt: u32,
}

impl TaskAssignment {
    /// Build the assignment for one task of a job.
    pub fn new(task: &Task, job: &Job, attempt: u32) -> Self {
        Self {
            task_id: task.id,
            job_id: job.id,
            capability: task.capability,
            contract_source: job.request.contract_source.clone(),
            contract_address: job.request.contract_address.clone(),
            chain_id: job.request.chain_id,
            attempt,
        }
    }
}

/// A message on an agent's input channel.
#[derive(Debug, Clone)]
pub enum AgentDirective {
    /// Execute the assignment and report back through the orchestrator
    /// handle, exactly once per attempt.
    Run(TaskAssignment),
    /// Stop work on the task if it is still running. Best-effort; a late
    /// result is discarded by the orchestrator anyway.
    Abandon {
        /// The task to abandon.
        task_id: Uuid,
    },
}

/// Delivery seam between the coordinator and agent input channels.
///
/// Dispatch is fire-and-forget: handing the assignment over must not wait
/// for the agent to execute it. Errors are transient from the caller's
/// point of view and are retried per [`RetryPolicy`].
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Hand an assignment to the given agent.
    async fn dispatch(&self, agent_id: &str, assignment: TaskAssignment) -> SolguardResult<()>;

    /// Ask the agent to abandon a task. Best-effort; failures are ignored.
    async fn abandon(&self, agent_id: &str, task_id: Uuid);
}

/// Retry behaviour for transient dispatch failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for a given 0-based attempt, capped at
    /// `backoff_max_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.backoff_max_ms)
    }
}

/// [`TaskDispatcher`] backed by one bounded mpsc channel per agent.
///
/// `dispatch` uses `try_send`, so a full agent mailbox is a transient
/// error rather than a stall of the coordinator.
pub struct ChannelDispatcher {
    channels: RwLock<HashMap<String, mpsc::Sender<AgentDirective>>>,
    capacity: usize,
}

impl ChannelDispatcher {
    /// Create a dispatcher whose agent mailboxes hold `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Create (or replace) the input channel for an agent and return the
    /// receiving end the agent should consume.
    pub fn attach(&self, agent_id: impl Into<String>) -> mpsc::Receiver<AgentDirective> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.channels.write().insert(agent_id.into(), tx);
        rx
    }

    /// Drop an agent's input channel.
    pub fn detach(&self, agent_id: &str) {
        self.channels.write().remove(agent_id);
    }
}

#[async_trait]
impl TaskDispatcher for ChannelDispatcher {
    async fn dispatch(&self, agent_id: &str, assignment: TaskAssignment) -> SolguardResult<()> {
        let sender = self
            .channels
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| {
                SolguardError::Dispatch(format!("no input channel for agent '{agent_id}'"))
            })?;

        sender
            .try_send(AgentDirective::Run(assignment))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SolguardError::Dispatch(format!("agent '{agent_id}' mailbox full"))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    SolguardError::Dispatch(format!("agent '{agent_id}' channel closed"))
                }
            })
    }

    async fn abandon(&self, agent_id: &str, task_id: Uuid) {
        let sender = self.channels.read().get(agent_id).cloned();
        if let Some(sender) = sender {
            if sender.try_send(AgentDirective::Abandon { task_id }).is_err() {
                debug!(%agent_id, %task_id, "abandon notice not delivered");
            }
        }
    }
}
