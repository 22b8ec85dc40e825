use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{JobRecord, QueueManager};

#[derive(Debug, Clone, PartialEq)]
pub enum JobExecution {
    Success(Option<Value>),
    /// Retried while attempts remain; `delay` overrides the backoff policy.
    Retry {
        delay: Option<Duration>,
        error: String,
    },
    Failed {
        error: String,
    },
}

impl JobExecution {
    pub fn retry(error: impl Into<String>) -> Self {
        JobExecution::Retry {
            delay: None,
            error: error.into(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        JobExecution::Failed {
            error: error.into(),
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn job_type(&self) -> &'static str;
    async fn handle(&self, ctx: JobContext) -> JobExecution;
}

/// Runs once a job is failed for good, after its last attempt or after it
/// stalled too often.
#[async_trait]
pub trait FailureHandler: Send + Sync + 'static {
    async fn on_failed(&self, job: &JobRecord, error: &str);
}

/// The reserved job plus a handle for progress reporting.
pub struct JobContext {
    pub job: JobRecord,
    manager: Arc<QueueManager>,
}

impl JobContext {
    pub(crate) fn new(job: JobRecord, manager: Arc<QueueManager>) -> Self {
        Self { job, manager }
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.job.payload.clone())
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    /// No retry follows this attempt if it fails.
    pub fn is_final_attempt(&self) -> bool {
        self.job.attempts >= self.job.max_attempts
    }

    /// Best effort; a lost progress update never fails the job.
    pub async fn progress(&self, percent: u8) {
        if let Err(err) = self.manager.report_progress(self.job.id, percent).await {
            debug!(job_id = %self.job.id, error = %err, "progress update dropped");
        }
    }
}
