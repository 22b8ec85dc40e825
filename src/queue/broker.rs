use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{BrokerError, JobRecord, NewJob, QueueCounts, QueueName, RetentionPolicy, TrimReport};

/// Storage and dispatch primitives the queue manager builds on.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Establishes the connection and makes sure every queue exists.
    async fn connect(&self) -> Result<(), BrokerError>;
    async fn ping(&self) -> Result<(), BrokerError>;
    async fn queue_ready(&self, queue: QueueName) -> Result<bool, BrokerError>;

    /// Inserts a job unless a live job already holds `(queue, job_key)`.
    /// Returns the job that holds the key and whether it was created now.
    async fn add(&self, job: NewJob) -> Result<(JobRecord, bool), BrokerError>;
    /// Most recent job with the key, live or finished.
    async fn find(&self, queue: QueueName, job_key: &str)
        -> Result<Option<JobRecord>, BrokerError>;

    /// Claims the most urgent due job of the given types, incrementing its
    /// attempt count. Paused queues yield nothing.
    async fn reserve(
        &self,
        queue: QueueName,
        job_types: &[String],
    ) -> Result<Option<JobRecord>, BrokerError>;
    async fn complete(&self, id: Uuid, result: Option<Value>) -> Result<(), BrokerError>;
    async fn retry(&self, id: Uuid, run_after: DateTime<Utc>, error: &str)
        -> Result<(), BrokerError>;
    async fn fail(&self, id: Uuid, error: &str) -> Result<JobRecord, BrokerError>;
    async fn update_progress(&self, id: Uuid, progress: u8) -> Result<(), BrokerError>;

    async fn set_paused(&self, queue: QueueName, paused: bool) -> Result<(), BrokerError>;
    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, BrokerError>;
    async fn trim(
        &self,
        queue: QueueName,
        policy: &RetentionPolicy,
        dry_run: bool,
    ) -> Result<TrimReport, BrokerError>;

    /// Moves active jobs whose lock is older than `lock_timeout` to stalled.
    /// Jobs that stalled more than `max_stalled` times fail instead and are
    /// returned.
    async fn recover_stalled(
        &self,
        queue: QueueName,
        lock_timeout: Duration,
        max_stalled: u32,
    ) -> Result<Vec<JobRecord>, BrokerError>;
}
