//! Durable, ordered job queue with lease-based delivery.
//!
//! Jobs are delivered at-least-once: a consumer takes a lease on a job
//! and must acknowledge it; a lease that is neither acked nor nacked
//! becomes visible again after its visibility timeout elapses. Consumers
//! must therefore treat processing as idempotent or deduplicate by job id.
//!
//! # Main types
//!
//! - [`JobQueue`] — The queue contract (enqueue / lease / ack / nack).
//! - [`MemoryQueue`] — In-process FIFO implementation.
//! - [`LeaseToken`] — Proof of temporary ownership of a leased job.

/// In-process queue implementation.
pub mod memory;
/// Queue contract and lease token.
pub mod queue;

pub use memory::MemoryQueue;
pub use queue::{JobQueue, LeaseToken};
