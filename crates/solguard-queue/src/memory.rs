use crate::queue::{JobQueue, LeaseToken};
use async_trait::async_trait;
use solguard_core::{Job, SolguardError, SolguardResult};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

struct Lease {
    job: Job,
    seq: u64,
    deadline: Instant,
}

struct Inner {
    /// Visible jobs keyed by enqueue sequence. Redelivery reinserts at the
    /// original sequence, so FIFO fairness survives nacks and expiries.
    ready: BTreeMap<u64, Job>,
    leases: HashMap<LeaseToken, Lease>,
    next_seq: u64,
}

impl Inner {
    /// Move every expired lease back into the ready map.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseToken> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(lease) = self.leases.remove(&token) {
                warn!(job_id = %lease.job.id, "lease expired, job redelivered");
                self.ready.insert(lease.seq, lease.job);
            }
        }
    }
}

/// In-process FIFO queue with lease-based at-least-once delivery.
///
/// A single mutex serializes lease/ack/nack per job, making the lease
/// table the sole source of truth for who owns a job at any moment.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: BTreeMap::new(),
                leases: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> SolguardResult<Uuid> {
        let job_id = job.id;
        {
            let mut inner = self.inner.lock().await;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.ready.insert(seq, job);
        }
        debug!(%job_id, "job enqueued");
        self.notify.notify_one();
        Ok(job_id)
    }

    async fn lease(
        &self,
        visibility_timeout: Duration,
    ) -> SolguardResult<Option<(Job, LeaseToken)>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.reclaim_expired(now);

        let Some((&seq, _)) = inner.ready.iter().next() else {
            return Ok(None);
        };
        let Some(job) = inner.ready.remove(&seq) else {
            return Ok(None);
        };

        let token = LeaseToken::new();
        inner.leases.insert(
            token,
            Lease {
                job: job.clone(),
                seq,
                deadline: now + visibility_timeout,
            },
        );
        debug!(job_id = %job.id, %token, "job leased");
        Ok(Some((job, token)))
    }

    async fn lease_wait(
        &self,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> SolguardResult<(Job, LeaseToken)> {
        loop {
            if let Some(leased) = self.lease(visibility_timeout).await? {
                return Ok(leased);
            }
            // The sleep arm picks up lease-expiry redeliveries, which do
            // not fire the enqueue notification.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn ack(&self, token: LeaseToken) -> SolguardResult<()> {
        let mut inner = self.inner.lock().await;
        inner.reclaim_expired(Instant::now());
        match inner.leases.remove(&token) {
            Some(lease) => {
                debug!(job_id = %lease.job.id, "job acknowledged");
                Ok(())
            }
            None => Err(SolguardError::Queue(format!(
                "ack for unknown or expired lease {token}"
            ))),
        }
    }

    async fn nack(&self, token: LeaseToken) -> SolguardResult<()> {
        let mut inner = self.inner.lock().await;
        inner.reclaim_expired(Instant::now());
        match inner.leases.remove(&token) {
            Some(lease) => {
                debug!(job_id = %lease.job.id, "job nacked, redelivering");
                inner.ready.insert(lease.seq, lease.job);
                drop(inner);
                self.notify.notify_one();
                Ok(())
            }
            None => Err(SolguardError::Queue(format!(
                "nack for unknown or expired lease {token}"
            ))),
        }
    }

    async fn cancel(&self, job_id: Uuid) -> SolguardResult<bool> {
        let mut inner = self.inner.lock().await;
        let seq = inner
            .ready
            .iter()
            .find(|(_, job)| job.id == job_id)
            .map(|(&seq, _)| seq);
        match seq {
            Some(seq) => {
                inner.ready.remove(&seq);
                debug!(%job_id, "queued job cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn depth(&self) -> usize {
        self.inner.lock().await.ready.len()
    }
}
