use serde::{Deserialize, Serialize};
use solguard_core::Capability;
use std::collections::HashMap;

/// What the coordinator does when some, but not all, of a job's required
/// capabilities have an eligible agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Any missing capability fails the whole job before anything is
    /// dispatched.
    #[default]
    AllOrNothing,
    /// Dispatch the available subset; each missing capability is recorded
    /// as a failed section of the report.
    BestEffort,
}

/// Declarative mapping from pipeline name to its ordered required
/// capability set.
///
/// New pipelines are additive: entries loaded from configuration extend
/// (or override) the built-in table rather than replacing routing code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineTable {
    pipelines: HashMap<String, Vec<Capability>>,
}

impl PipelineTable {
    /// The built-in pipelines: `quick` (static only), `standard`
    /// (static + dynamic), `deep` (static + dynamic + ml).
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.define("quick", vec![Capability::Static]);
        table.define("standard", vec![Capability::Static, Capability::Dynamic]);
        table.define(
            "deep",
            vec![Capability::Static, Capability::Dynamic, Capability::Ml],
        );
        table
    }

    /// A table with no pipelines.
    pub fn empty() -> Self {
        Self {
            pipelines: HashMap::new(),
        }
    }

    /// Define (or redefine) a pipeline. Duplicate capabilities are
    /// dropped, keeping first occurrence order.
    pub fn define(&mut self, name: impl Into<String>, capabilities: Vec<Capability>) {
        let mut seen = Vec::new();
        for cap in capabilities {
            if !seen.contains(&cap) {
                seen.push(cap);
            }
        }
        self.pipelines.insert(name.into(), seen);
    }

    /// Extend this table with every entry of `other`, overriding on name
    /// collision.
    pub fn extend(&mut self, other: PipelineTable) {
        for (name, caps) in other.pipelines {
            self.define(name, caps);
        }
    }

    /// The required capabilities of a pipeline, in dispatch order.
    pub fn resolve(&self, name: &str) -> Option<&[Capability]> {
        self.pipelines.get(name).map(Vec::as_slice)
    }

    /// Defined pipeline names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for PipelineTable {
    fn default() -> Self {
        Self::builtin()
    }
}
