//! Persistence for aggregated analysis reports, keyed by job id.
//!
//! The orchestrator persists exactly one [`AnalysisReport`] per job when
//! the job reaches a terminal state; the API layer fetches it by job id.
//! Persisting the same job id twice overwrites, so finalization is
//! idempotent.
//!
//! # Main types
//!
//! - [`ResultsSink`] — persist / fetch contract.
//! - [`MemorySink`] — in-process map, for tests and single-node runs.
//! - [`FileSink`] — one JSON document per job id under a directory.
//!
//! [`AnalysisReport`]: solguard_core::AnalysisReport

/// Sink contract and provided implementations.
pub mod store;

pub use store::{FileSink, MemorySink, ResultsSink};
