//! Core types and error definitions for the Solguard analysis pipeline.
//!
//! This crate provides the foundational types shared across all Solguard
//! crates: the unified error enum, the job/task domain model, and the
//! report shapes produced by result aggregation.
//!
//! # Main types
//!
//! - [`SolguardError`] — Unified error enum for all Solguard subsystems.
//! - [`SolguardResult`] — Convenience alias for `Result<T, SolguardError>`.
//! - [`Capability`] — An analysis type an agent can perform.
//! - [`Job`] / [`Task`] — A submitted analysis job and its per-capability
//!   units of work.
//! - [`AnalysisReport`] — The aggregated, per-capability result of a job.

/// Job and task domain model.
pub mod job;
/// Findings and aggregated analysis reports.
pub mod report;

pub use job::{AnalysisRequest, Capability, Job, JobStatus, Task, TaskStatus};
pub use report::{AnalysisReport, CapabilitySection, Finding, Severity, TaskOutcome};

/// Top-level error type for the Solguard orchestration core.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum SolguardError {
    /// The job queue rejected or could not serve an operation
    /// (unknown lease token, queue backend unavailable). Transient for
    /// `lease`; callers retry with backoff.
    #[error("Queue error: {0}")]
    Queue(String),

    /// No registered agent advertises the requested capability, or every
    /// matching agent is busy or unreachable. Terminal for the job.
    #[error("No capable agent for capability '{0}'")]
    NoCapableAgent(Capability),

    /// A task could not be handed to its selected agent. Transient; the
    /// coordinator retries with bounded backoff before failing the task.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// An error from the orchestrator state machine (unknown job, invalid
    /// transition request).
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An error from the agent registry.
    #[error("Registry error: {0}")]
    Registry(String),

    /// The results sink could not persist or fetch a report.
    #[error("Sink error: {0}")]
    Sink(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`SolguardError`].
pub type SolguardResult<T> = Result<T, SolguardError>;
