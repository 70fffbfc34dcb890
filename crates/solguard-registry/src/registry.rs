use crate::policy::{Candidate, LeastLoaded, SelectionPolicy};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use solguard_core::{Capability, SolguardError, SolguardResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Health of a registered agent, as reported by its heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Accepting new dispatches.
    Available,
    /// Alive but at capacity; excluded from selection.
    Busy,
    /// Heartbeats stopped or the agent reported itself down.
    Unreachable,
}

/// An agent's advertised capabilities and observed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Stable agent id (e.g. `"static-1"`).
    pub id: String,
    /// Capabilities this agent can execute.
    pub capabilities: Vec<Capability>,
    /// Last reported health.
    pub health: Health,
    /// Tasks currently in flight on this agent.
    #[serde(default)]
    pub load: u32,
    /// Time of the last heartbeat (or registration).
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentDescriptor {
    /// Describe an available agent with the given capabilities.
    pub fn new(id: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities,
            health: Health::Available,
            load: 0,
            last_heartbeat: Utc::now(),
        }
    }
}

struct AgentEntry {
    capabilities: Vec<Capability>,
    health: Health,
    /// In-flight task count. Atomic so multiple coordinator workers can
    /// adjust it under the read lock.
    load: AtomicU32,
    last_heartbeat: DateTime<Utc>,
}

/// Tracks available agents, their capabilities, load, and health.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
    policy: Box<dyn SelectionPolicy>,
}

impl AgentRegistry {
    /// Create a registry with the default [`LeastLoaded`] policy.
    pub fn new() -> Self {
        Self::with_policy(Box::new(LeastLoaded))
    }

    /// Create a registry with a custom selection policy.
    pub fn with_policy(policy: Box<dyn SelectionPolicy>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Register (or re-register) an agent. Re-registration resets the load
    /// counter and adopts the descriptor's health.
    pub fn register(&self, descriptor: AgentDescriptor) {
        info!(
            agent_id = %descriptor.id,
            capabilities = ?descriptor.capabilities,
            "agent registered"
        );
        let mut agents = self.agents.write();
        agents.insert(
            descriptor.id,
            AgentEntry {
                capabilities: descriptor.capabilities,
                health: descriptor.health,
                load: AtomicU32::new(descriptor.load),
                last_heartbeat: Utc::now(),
            },
        );
    }

    /// Record a health signal from an agent.
    pub fn heartbeat(&self, agent_id: &str, health: Health) -> SolguardResult<()> {
        let mut agents = self.agents.write();
        let entry = agents.get_mut(agent_id).ok_or_else(|| {
            SolguardError::Registry(format!("heartbeat from unknown agent '{agent_id}'"))
        })?;
        if entry.health != health {
            debug!(%agent_id, from = ?entry.health, to = ?health, "agent health changed");
        }
        entry.health = health;
        entry.last_heartbeat = Utc::now();
        Ok(())
    }

    /// Select an agent for the given capability.
    ///
    /// Only `available` agents advertising the capability are considered;
    /// the configured policy picks among them. Returns
    /// [`SolguardError::NoCapableAgent`] when no agent is eligible.
    pub fn select(&self, capability: Capability) -> SolguardResult<String> {
        let agents = self.agents.read();
        let candidates: Vec<Candidate> = agents
            .iter()
            .filter(|(_, entry)| {
                entry.health == Health::Available && entry.capabilities.contains(&capability)
            })
            .map(|(id, entry)| Candidate {
                id: id.clone(),
                load: entry.load.load(Ordering::Relaxed),
            })
            .collect();

        self.policy
            .pick(&candidates)
            .ok_or(SolguardError::NoCapableAgent(capability))
    }

    /// Count a task as in flight on the agent. Called around dispatch.
    pub fn begin_dispatch(&self, agent_id: &str) {
        let agents = self.agents.read();
        if let Some(entry) = agents.get(agent_id) {
            entry.load.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Release an in-flight slot on the agent. Called when its task
    /// reaches a terminal state. Saturates at zero.
    pub fn finish_dispatch(&self, agent_id: &str) {
        let agents = self.agents.read();
        if let Some(entry) = agents.get(agent_id) {
            let _ = entry
                .load
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }

    /// Mark agents whose last heartbeat is older than `ttl` as
    /// unreachable. Returns the ids that transitioned.
    pub fn prune_stale(&self, ttl: Duration) -> Vec<String> {
        // A ttl too large for chrono means nothing can be stale.
        let Ok(ttl) = ChronoDuration::from_std(ttl) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - ttl;

        let mut agents = self.agents.write();
        let mut pruned = Vec::new();
        for (id, entry) in agents.iter_mut() {
            if entry.health != Health::Unreachable && entry.last_heartbeat < cutoff {
                warn!(agent_id = %id, "no heartbeat within ttl, marking unreachable");
                entry.health = Health::Unreachable;
                pruned.push(id.clone());
            }
        }
        pruned
    }

    /// Snapshot of every registered agent, sorted by id.
    pub fn snapshot(&self) -> Vec<AgentDescriptor> {
        let agents = self.agents.read();
        let mut out: Vec<AgentDescriptor> = agents
            .iter()
            .map(|(id, entry)| AgentDescriptor {
                id: id.clone(),
                capabilities: entry.capabilities.clone(),
                health: entry.health,
                load: entry.load.load(Ordering::Relaxed),
                last_heartbeat: entry.last_heartbeat,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
