/// A selectable agent as seen by a [`SelectionPolicy`].
///
/// Candidates handed to a policy are already filtered: all are `available`
/// and advertise the requested capability.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Agent id.
    pub id: String,
    /// Number of tasks currently in flight on this agent.
    pub load: u32,
}

/// Strategy for choosing one agent among the eligible candidates.
pub trait SelectionPolicy: Send + Sync {
    /// Pick one candidate, or `None` if the slice is empty.
    fn pick(&self, candidates: &[Candidate]) -> Option<String>;

    /// Policy name, for logs.
    fn name(&self) -> &'static str;
}

/// Prefer the least-loaded agent; ties break by agent id ascending, which
/// keeps selection reproducible in tests.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl SelectionPolicy for LeastLoaded {
    fn pick(&self, candidates: &[Candidate]) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)))
            .map(|c| c.id.clone())
    }

    fn name(&self) -> &'static str {
        "least_loaded"
    }
}

/// Always pick the lexicographically smallest agent id, ignoring load.
#[derive(Debug, Default)]
pub struct LowestId;

impl SelectionPolicy for LowestId {
    fn pick(&self, candidates: &[Candidate]) -> Option<String> {
        candidates.iter().map(|c| c.id.clone()).min()
    }

    fn name(&self) -> &'static str {
        "lowest_id"
    }
}
