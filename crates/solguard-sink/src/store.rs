use async_trait::async_trait;
use solguard_core::{AnalysisReport, SolguardError, SolguardResult};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Persistence contract for finalized analysis reports.
#[async_trait]
pub trait ResultsSink: Send + Sync {
    /// Persist a report under its job id, overwriting any previous one.
    async fn persist(&self, report: &AnalysisReport) -> SolguardResult<()>;

    /// Fetch the report for a job, or `None` if the job has no persisted
    /// report yet.
    async fn fetch(&self, job_id: Uuid) -> SolguardResult<Option<AnalysisReport>>;
}

/// In-process sink backed by a map.
pub struct MemorySink {
    reports: RwLock<HashMap<Uuid, AnalysisReport>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self {
            reports: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultsSink for MemorySink {
    async fn persist(&self, report: &AnalysisReport) -> SolguardResult<()> {
        debug!(job_id = %report.job_id, "report persisted");
        let mut reports = self.reports.write().await;
        reports.insert(report.job_id, report.clone());
        Ok(())
    }

    async fn fetch(&self, job_id: Uuid) -> SolguardResult<Option<AnalysisReport>> {
        let reports = self.reports.read().await;
        Ok(reports.get(&job_id).cloned())
    }
}

/// File-based sink: one pretty-printed JSON document per job id.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    /// Create the sink, creating the directory if needed.
    pub async fn new(dir: PathBuf) -> SolguardResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn report_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }
}

#[async_trait]
impl ResultsSink for FileSink {
    async fn persist(&self, report: &AnalysisReport) -> SolguardResult<()> {
        let path = self.report_path(report.job_id);
        let json = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&path, json).await?;
        debug!(job_id = %report.job_id, path = %path.display(), "report persisted");
        Ok(())
    }

    async fn fetch(&self, job_id: Uuid) -> SolguardResult<Option<AnalysisReport>> {
        let path = self.report_path(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let report: AnalysisReport = serde_json::from_str(&data)
            .map_err(|e| SolguardError::Sink(format!("failed to parse report: {e}")))?;
        Ok(Some(report))
    }
}
