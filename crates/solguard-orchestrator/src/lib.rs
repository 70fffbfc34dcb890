//! Job orchestration and agent routing for the Solguard analysis
//! pipeline.
//!
//! Implements the coordinator/orchestrator pair at the heart of the
//! system: the coordinator drains the job queue, derives per-capability
//! tasks, and dispatches them to agents selected through the registry;
//! the orchestrator engine owns the job state machine, absorbs
//! asynchronous agent callbacks, aggregates results, and persists the
//! final report.
//!
//! # Main types
//!
//! - [`OrchestrationContext`] — Per-process wiring of queue, registry,
//!   engine, workers, and sink; the submit/status/report/cancel surface.
//! - [`Coordinator`] — Routes one job into tasks and dispatches them.
//! - [`Orchestrator`] — Event-driven job state machine engine.
//! - [`OrchestratorHandle`] — Callback channel agents report through.
//! - [`PipelineTable`] — Declarative pipeline → capability mapping.
//! - [`ChannelDispatcher`] — Per-agent bounded input channels.

/// Runtime configuration.
pub mod config;
/// The orchestration context (per-process wiring).
pub mod context;
/// Job routing and dispatch.
pub mod coordinator;
/// Agent dispatch seam and retry policy.
pub mod dispatch;
/// The job state machine engine.
pub mod engine;
/// Structured lifecycle event log.
pub mod events;
/// Job and task state store.
pub mod jobs;
/// Pipeline capability mapping and routing policy.
pub mod pipelines;

pub use config::OrchestratorConfig;
pub use context::OrchestrationContext;
pub use coordinator::{Coordinator, RouteOutcome};
pub use dispatch::{
    AgentDirective, ChannelDispatcher, RetryPolicy, TaskAssignment, TaskDispatcher,
};
pub use engine::{JobEvent, Orchestrator, OrchestratorHandle};
pub use events::{EventKind, EventLog, OrchestrationEvent};
pub use jobs::JobTable;
pub use pipelines::{PipelineTable, RoutingPolicy};
