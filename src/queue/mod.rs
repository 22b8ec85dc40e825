//! Job queues for the document pipeline.
//!
//! A [`QueueManager`] owns the three named queues on top of a [`Broker`]
//! (Postgres or in-memory). It tracks broker connectivity, reconnects with
//! capped backoff, and refuses work with [`QueueError::NotReady`] while the
//! broker is down instead of dropping it.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

mod broker;
mod manager;
mod memory;
mod postgres;
mod scheduler;
mod worker;

pub use broker::Broker;
pub use manager::{ConnectionSnapshot, QueueManager, QueueSettings};
pub use memory::MemoryBroker;
pub use postgres::PgBroker;
pub use scheduler::{CleanupScheduler, ScheduleEntry};
pub use worker::{FailureHandler, JobContext, JobExecution, JobHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    DocumentGeneration,
    CrmUpload,
    Cleanup,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [
        QueueName::DocumentGeneration,
        QueueName::CrmUpload,
        QueueName::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::DocumentGeneration => "document-generation",
            QueueName::CrmUpload => "crm-upload",
            QueueName::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|queue| queue.as_str() == value)
            .ok_or_else(|| QueueError::UnknownQueue(value.to_string()))
    }
}

/// Lifecycle state of a job. `Delayed` is a waiting job whose `run_after`
/// lies in the future; it is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Stalled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stalled => "stalled",
        }
    }

    /// Live jobs hold their key: a second submit with the same key collapses
    /// onto them.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            JobState::Waiting | JobState::Delayed | JobState::Active | JobState::Stalled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = BrokerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "stalled" => Ok(JobState::Stalled),
            other => Err(BrokerError::Backend(format!("unknown job state: {other}"))),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("job not found")]
    NotFound,
    #[error("broker error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue service is not ready: {0}")]
    NotReady(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("job not found")]
    NotFound,
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(BrokerError),
}

impl From<BrokerError> for QueueError {
    fn from(value: BrokerError) -> Self {
        match value {
            BrokerError::NotFound => QueueError::NotFound,
            other => QueueError::Broker(other),
        }
    }
}

/// `min(base * 2^(attempt - 1), max)` for `attempt >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Deterministic key; a random one is generated when absent.
    pub job_key: Option<String>,
    /// Higher runs first.
    pub priority: i32,
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl JobOptions {
    pub fn keyed(job_key: impl Into<String>) -> Self {
        Self {
            job_key: Some(job_key.into()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: QueueName,
    pub job_key: String,
    pub job_type: String,
    pub payload: Value,
    pub priority: i32,
    pub max_attempts: u32,
    pub run_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue: QueueName,
    pub job_key: String,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub stalled_count: u32,
    pub progress: u8,
    pub run_after: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// State as seen by callers: waiting jobs scheduled in the future read as
    /// delayed.
    pub fn observed_state(&self, now: DateTime<Utc>) -> JobState {
        if self.state == JobState::Waiting && self.run_after > now {
            JobState::Delayed
        } else {
            self.state
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            job_key: self.job_key.clone(),
            queue: self.queue,
            state: self.observed_state(Utc::now()),
            progress: self.progress,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            error: self.last_error.clone(),
            result: self.result.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub job_key: String,
    pub queue: QueueName,
    /// False when the submit collapsed onto an existing live job.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub job_key: String,
    pub queue: QueueName,
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub stalled: u64,
    pub paused: bool,
}

/// How much finished-job history to keep per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_completed: u64,
    pub failed_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 50,
            failed_max_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Finished jobs matched by a trim; they were only counted on a dry run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrimReport {
    pub completed: u64,
    pub failed: u64,
}

impl TrimReport {
    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }

    pub(crate) fn merge(self, other: TrimReport) -> TrimReport {
        TrimReport {
            completed: self.completed + other.completed,
            failed: self.failed + other.failed,
        }
    }
}
