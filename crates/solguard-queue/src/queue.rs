use async_trait::async_trait;
use solguard_core::{Job, SolguardResult};
use std::time::Duration;
use uuid::Uuid;

/// Proof of temporary ownership of a leased job.
///
/// The token is only valid until the lease's visibility timeout elapses;
/// `ack`/`nack` with an expired token is an error and the job will have
/// been made visible to other consumers again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Contract for the job holding area between submission and routing.
///
/// Ordering is FIFO by enqueue time; redelivered jobs keep their original
/// position so later arrivals are never starved.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job to the queue. Returns the job id.
    async fn enqueue(&self, job: Job) -> SolguardResult<Uuid>;

    /// Take a lease on the next visible job, if any.
    ///
    /// The job stays invisible to other consumers until `ack`, `nack`, or
    /// expiry of `visibility_timeout`, whichever comes first.
    async fn lease(
        &self,
        visibility_timeout: Duration,
    ) -> SolguardResult<Option<(Job, LeaseToken)>>;

    /// Like [`lease`](Self::lease), but suspends until a job is available.
    ///
    /// The default implementation polls at `poll_interval`; implementations
    /// with an internal wakeup mechanism should override it.
    async fn lease_wait(
        &self,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> SolguardResult<(Job, LeaseToken)> {
        loop {
            if let Some(leased) = self.lease(visibility_timeout).await? {
                return Ok(leased);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Acknowledge a leased job, removing it permanently.
    async fn ack(&self, token: LeaseToken) -> SolguardResult<()>;

    /// Return a leased job to the queue for redelivery.
    async fn nack(&self, token: LeaseToken) -> SolguardResult<()>;

    /// Remove a still-queued (unleased) job. Returns `true` if the job was
    /// found and removed; a leased or unknown job returns `false`.
    async fn cancel(&self, job_id: Uuid) -> SolguardResult<bool>;

    /// Number of jobs currently visible (not leased).
    async fn depth(&self) -> usize;
}
