use crate::dispatch::RetryPolicy;
use crate::pipelines::{PipelineTable, RoutingPolicy};
use serde::{Deserialize, Serialize};
use solguard_core::{SolguardError, SolguardResult};
use std::path::PathBuf;
use std::time::Duration;

fn default_visibility_timeout_secs() -> u64 {
    30
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_heartbeat_ttl_secs() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}
fn default_coordinator_workers() -> usize {
    2
}
fn default_channel_capacity() -> usize {
    64
}

/// Tunables of the orchestration core, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long a leased job stays invisible before redelivery.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// How long a dispatched task may run before it is timed out.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// How long an agent may stay silent before it is marked unreachable.
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,
    /// Fallback poll interval for queue consumers.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval of the deadline/health sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Number of coordinator workers draining the queue.
    #[serde(default = "default_coordinator_workers")]
    pub coordinator_workers: usize,
    /// Capacity of the engine event channel and agent mailboxes.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Directory for the JSONL event log; `None` logs to tracing only.
    #[serde(default)]
    pub event_log_dir: Option<PathBuf>,
    /// What to do when only part of a pipeline's capabilities is routable.
    #[serde(default)]
    pub routing: RoutingPolicy,
    /// Retry behaviour for transient dispatch failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Extra pipelines, merged over the built-in table (overriding on
    /// name collision).
    #[serde(default = "PipelineTable::empty")]
    pub pipelines: PipelineTable,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            coordinator_workers: default_coordinator_workers(),
            channel_capacity: default_channel_capacity(),
            event_log_dir: None,
            routing: RoutingPolicy::default(),
            retry: RetryPolicy::default(),
            pipelines: PipelineTable::empty(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> SolguardResult<Self> {
        toml::from_str(text).map_err(|e| SolguardError::Config(e.to_string()))
    }

    /// The effective pipeline table: built-ins extended by configured
    /// entries.
    pub fn pipeline_table(&self) -> PipelineTable {
        let mut table = PipelineTable::builtin();
        table.extend(self.pipelines.clone());
        table
    }

    /// Lease visibility timeout.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Task execution deadline.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Agent heartbeat time-to-live.
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    /// Queue poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Deadline/health sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solguard_core::Capability;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.visibility_timeout(), Duration::from_secs(30));
        assert_eq!(config.coordinator_workers, 2);
        assert_eq!(config.routing, RoutingPolicy::AllOrNothing);
        assert!(config.event_log_dir.is_none());
        // Built-ins are available even with an empty configured table.
        assert!(config.pipeline_table().resolve("deep").is_some());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            task_timeout_secs = 10
            routing = "best_effort"

            [pipelines]
            audit = ["static", "ml"]
            quick = ["dynamic"]
            "#,
        )
        .unwrap();

        assert_eq!(config.task_timeout(), Duration::from_secs(10));
        assert_eq!(config.routing, RoutingPolicy::BestEffort);
        // Untouched fields keep their defaults.
        assert_eq!(config.visibility_timeout_secs, 30);

        let table = config.pipeline_table();
        // Added pipeline, overridden built-in, untouched built-in.
        assert_eq!(
            table.resolve("audit"),
            Some(&[Capability::Static, Capability::Ml][..])
        );
        assert_eq!(table.resolve("quick"), Some(&[Capability::Dynamic][..]));
        assert_eq!(
            table.resolve("standard"),
            Some(&[Capability::Static, Capability::Dynamic][..])
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = OrchestratorConfig::from_toml_str("task_timeout_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, SolguardError::Config(_)));
    }
}
