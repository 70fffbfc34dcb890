use crate::job::{Capability, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a security finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational note, no direct security impact.
    Informational,
    /// Low-impact issue.
    Low,
    /// Medium-impact issue.
    Medium,
    /// High-impact issue.
    High,
    /// Exploitable vulnerability with direct fund or control impact.
    Critical,
}

/// A single security finding reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Severity classification.
    pub severity: Severity,
    /// Short title (e.g. "Reentrancy in withdraw()").
    pub title: String,
    /// Full description of the issue.
    pub description: String,
    /// Tool-specific location payload (file, line range, function, pc).
    #[serde(default)]
    pub location: serde_json::Value,
    /// Suggested remediation.
    #[serde(default)]
    pub recommendation: String,
}

impl Finding {
    /// Create a finding with empty location and recommendation.
    pub fn new(
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            title: title.into(),
            description: description.into(),
            location: serde_json::Value::Null,
            recommendation: String::new(),
        }
    }

    /// Attach a remediation suggestion.
    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = recommendation.into();
        self
    }
}

/// How one task of a job ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The agent completed its analysis.
    Succeeded {
        /// Findings reported by the agent (possibly empty).
        findings: Vec<Finding>,
    },
    /// The agent or the dispatcher reported a failure.
    Failed {
        /// Failure reason.
        reason: String,
    },
    /// No agent callback arrived before the deadline.
    TimedOut,
    /// The parent job was cancelled before the task finished.
    Cancelled,
}

/// The per-capability slice of an [`AnalysisReport`].
///
/// Failed and timed-out tasks are recorded alongside successes, never
/// silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySection {
    /// The capability this section covers.
    pub capability: Capability,
    /// The agent that executed (or was assigned) the task, when known.
    pub agent_id: Option<String>,
    /// How the task ended.
    pub outcome: TaskOutcome,
}

/// The aggregated result of a job, persisted by the results sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// The job this report belongs to.
    pub job_id: Uuid,
    /// Terminal status of the job.
    pub status: JobStatus,
    /// One section per task, in task creation (`seq`) order.
    pub sections: Vec<CapabilitySection>,
    /// Time the job reached its terminal state.
    pub finished_at: DateTime<Utc>,
}

impl AnalysisReport {
    /// All findings across succeeded sections, in section order.
    pub fn findings(&self) -> Vec<&Finding> {
        self.sections
            .iter()
            .filter_map(|s| match &s.outcome {
                TaskOutcome::Succeeded { findings } => Some(findings.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Number of sections that ended in success.
    pub fn succeeded_count(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| matches!(s.outcome, TaskOutcome::Succeeded { .. }))
            .count()
    }

    /// Number of sections that did not succeed.
    pub fn failed_count(&self) -> usize {
        self.sections.len() - self.succeeded_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(sections: Vec<CapabilitySection>) -> AnalysisReport {
        AnalysisReport {
            job_id: Uuid::new_v4(),
            status: JobStatus::Completed,
            sections,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_findings_span_only_succeeded_sections() {
        let report = report_with(vec![
            CapabilitySection {
                capability: Capability::Static,
                agent_id: Some("static-1".into()),
                outcome: TaskOutcome::Succeeded {
                    findings: vec![Finding::new(
                        Severity::High,
                        "Reentrancy in withdraw()",
                        "External call before state update",
                    )],
                },
            },
            CapabilitySection {
                capability: Capability::Dynamic,
                agent_id: Some("dyn-1".into()),
                outcome: TaskOutcome::Failed {
                    reason: "fuzzer crashed".into(),
                },
            },
        ]);

        assert_eq!(report.findings().len(), 1);
        assert_eq!(report.succeeded_count(), 1);
        assert_eq!(report.failed_count(), 1);
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let outcome = TaskOutcome::Failed {
            reason: "no_capable_agent".into(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains(r#""result":"failed""#));
        let parsed: TaskOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, outcome);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low > Severity::Informational);
    }

    #[test]
    fn test_report_roundtrip() {
        let report = report_with(vec![CapabilitySection {
            capability: Capability::Ml,
            agent_id: None,
            outcome: TaskOutcome::TimedOut,
        }]);
        let json = serde_json::to_string(&report).unwrap();
        let parsed: AnalysisReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sections, report.sections);
    }
}
