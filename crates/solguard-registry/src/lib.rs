//! Registry of specialized analysis agents.
//!
//! Tracks which agents are alive, what they can do, and how loaded they
//! are, and answers the coordinator's "who should run this capability"
//! question through a pluggable selection policy.
//!
//! Registry entries are eventually consistent: health is whatever the last
//! heartbeat said, and a `busy`/`unreachable` agent is never selected until
//! a heartbeat transitions it back to `available`.
//!
//! # Main types
//!
//! - [`AgentRegistry`] — register / heartbeat / select, with per-agent
//!   in-flight counters.
//! - [`AgentDescriptor`] — an agent's advertised capabilities and state.
//! - [`SelectionPolicy`] — pluggable choice among eligible agents
//!   ([`LeastLoaded`] is the default).

/// Selection policies.
pub mod policy;
/// The registry itself.
pub mod registry;

pub use policy::{Candidate, LeastLoaded, LowestId, SelectionPolicy};
pub use registry::{AgentDescriptor, AgentRegistry, Health};
