//! Async Job Manager
//!
//! Long-running lifecycle work runs off the request path. Callers submit a
//! future and get a job id back immediately; the outcome is polled later.

use crate::error::{EntityKind, Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, Instrument};

pub type JobId = String;

/// State of a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    /// Finished; `location` names the resource to fetch, if any
    Completed { location: Option<String> },
    Failed { error: String },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

/// Bookkeeping for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub operation: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Tracks background jobs
#[derive(Debug, Clone, Default)]
pub struct JobManager {
    jobs: Arc<DashMap<JobId, JobRecord>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` in the background and return its id
    ///
    /// `work` resolves to an optional location on success. A panic inside
    /// `work` marks the job failed.
    pub fn submit<F, Fut>(&self, operation: &str, work: F) -> JobId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        let id = crate::topology::generate_id();
        self.jobs.insert(
            id.clone(),
            JobRecord {
                id: id.clone(),
                operation: operation.to_string(),
                status: JobStatus::Pending,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let job_id = id.clone();
        let span = tracing::info_span!("job", id = %job_id, operation = %operation);

        tokio::spawn(
            async move {
                debug!("Job started");
                let status = match tokio::spawn(async move { work().await }).await {
                    Ok(Ok(location)) => {
                        info!("Job completed");
                        JobStatus::Completed { location }
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Job failed");
                        JobStatus::Failed {
                            error: e.to_string(),
                        }
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "Job panicked");
                        JobStatus::Failed {
                            error: format!("job aborted: {}", join_err),
                        }
                    }
                };

                if let Some(mut record) = jobs.get_mut(&job_id) {
                    record.status = status;
                    record.finished_at = Some(Utc::now());
                }
            }
            .instrument(span),
        );

        id
    }

    /// Look up a job
    pub fn status(&self, id: &str) -> Result<JobRecord> {
        self.jobs
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::not_found(EntityKind::Job, id))
    }

    /// Poll until the job finishes or `timeout` elapses
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<JobRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.status(id)?;
            if record.status.is_finished() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Internal(format!(
                    "timed out waiting for job {}",
                    id
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drop finished jobs older than `older_than`; returns how many went
    pub fn prune(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(older_than)
            .map(|age| Utc::now() - age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = self.jobs.len();
        self.jobs
            .retain(|_, record| !matches!(record.finished_at, Some(at) if at < cutoff));
        let pruned = before.saturating_sub(self.jobs.len());
        if pruned > 0 {
            debug!(pruned, "Pruned finished jobs");
        }
        pruned
    }

    /// Number of jobs still running
    pub fn pending(&self) -> usize {
        self.jobs
            .iter()
            .filter(|r| r.status == JobStatus::Pending)
            .count()
    }
}
