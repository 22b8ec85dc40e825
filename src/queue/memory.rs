use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{
    Broker, BrokerError, JobRecord, JobState, NewJob, QueueCounts, QueueName, RetentionPolicy,
    TrimReport,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, JobRecord>,
    paused: HashSet<QueueName>,
    connected: bool,
    down: bool,
}

/// Single-process broker. `set_available(false)` simulates an outage: every
/// call fails with `Unavailable` until it is switched back on.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.down = !available;
        if !available {
            inner.connected = false;
        }
    }

    /// Every job ever added, oldest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut jobs: Vec<_> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BrokerError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| BrokerError::Backend("memory broker poisoned".into()))?;
        if inner.down {
            return Err(BrokerError::Unavailable("memory broker is offline".into()));
        }
        Ok(inner)
    }

    fn connected(&self) -> Result<MutexGuard<'_, Inner>, BrokerError> {
        let inner = self.lock()?;
        if !inner.connected {
            return Err(BrokerError::Unavailable("memory broker not connected".into()));
        }
        Ok(inner)
    }
}

fn job_mut(inner: &mut Inner, id: Uuid) -> Result<&mut JobRecord, BrokerError> {
    inner.jobs.get_mut(&id).ok_or(BrokerError::NotFound)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.lock()?.connected = true;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.connected().map(|_| ())
    }

    async fn queue_ready(&self, _queue: QueueName) -> Result<bool, BrokerError> {
        self.connected().map(|_| true)
    }

    async fn add(&self, job: NewJob) -> Result<(JobRecord, bool), BrokerError> {
        let mut inner = self.connected()?;
        if let Some(existing) = inner
            .jobs
            .values()
            .find(|j| j.queue == job.queue && j.job_key == job.job_key && j.state.is_live())
        {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let record = JobRecord {
            id: Uuid::new_v4(),
            queue: job.queue,
            job_key: job.job_key,
            job_type: job.job_type,
            payload: job.payload,
            state: JobState::Waiting,
            priority: job.priority,
            attempts: 0,
            max_attempts: job.max_attempts,
            stalled_count: 0,
            progress: 0,
            run_after: job.run_after,
            locked_at: None,
            last_error: None,
            result: None,
            finished_at: None,
            created_at: now,
        };
        inner.jobs.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn find(
        &self,
        queue: QueueName,
        job_key: &str,
    ) -> Result<Option<JobRecord>, BrokerError> {
        let inner = self.connected()?;
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.job_key == job_key)
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    async fn reserve(
        &self,
        queue: QueueName,
        job_types: &[String],
    ) -> Result<Option<JobRecord>, BrokerError> {
        let mut inner = self.connected()?;
        if inner.paused.contains(&queue) {
            return Ok(None);
        }

        let now = Utc::now();
        let next = inner
            .jobs
            .values()
            .filter(|job| {
                job.queue == queue
                    && matches!(job.state, JobState::Waiting | JobState::Stalled)
                    && job.run_after <= now
                    && job_types.iter().any(|ty| *ty == job.job_type)
            })
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.run_after.cmp(&b.run_after))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = job_mut(&mut inner, id)?;
        job.state = JobState::Active;
        job.attempts += 1;
        job.locked_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: Uuid, result: Option<Value>) -> Result<(), BrokerError> {
        let mut inner = self.connected()?;
        let job = job_mut(&mut inner, id)?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.result = result;
        job.locked_at = None;
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn retry(
        &self,
        id: Uuid,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError> {
        let mut inner = self.connected()?;
        let job = job_mut(&mut inner, id)?;
        job.state = JobState::Waiting;
        job.run_after = run_after;
        job.last_error = Some(error.to_string());
        job.locked_at = None;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<JobRecord, BrokerError> {
        let mut inner = self.connected()?;
        let job = job_mut(&mut inner, id)?;
        job.state = JobState::Failed;
        job.last_error = Some(error.to_string());
        job.locked_at = None;
        job.finished_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn update_progress(&self, id: Uuid, progress: u8) -> Result<(), BrokerError> {
        let mut inner = self.connected()?;
        job_mut(&mut inner, id)?.progress = progress.min(100);
        Ok(())
    }

    async fn set_paused(&self, queue: QueueName, paused: bool) -> Result<(), BrokerError> {
        let mut inner = self.connected()?;
        if paused {
            inner.paused.insert(queue);
        } else {
            inner.paused.remove(&queue);
        }
        Ok(())
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, BrokerError> {
        let inner = self.connected()?;
        let now = Utc::now();
        let mut counts = QueueCounts {
            paused: inner.paused.contains(&queue),
            ..QueueCounts::default()
        };
        for job in inner.jobs.values().filter(|job| job.queue == queue) {
            match job.observed_state(now) {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Stalled => counts.stalled += 1,
            }
        }
        Ok(counts)
    }

    async fn trim(
        &self,
        queue: QueueName,
        policy: &RetentionPolicy,
        dry_run: bool,
    ) -> Result<TrimReport, BrokerError> {
        let mut inner = self.connected()?;
        let failed_cutoff = Utc::now()
            - chrono::Duration::from_std(policy.failed_max_age)
                .unwrap_or_else(|_| chrono::Duration::days(7));

        let mut completed: Vec<&JobRecord> = inner
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.state == JobState::Completed)
            .collect();
        completed.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        let mut doomed: Vec<Uuid> = completed
            .iter()
            .skip(policy.keep_completed as usize)
            .map(|job| job.id)
            .collect();
        let completed_count = doomed.len() as u64;

        doomed.extend(
            inner
                .jobs
                .values()
                .filter(|job| {
                    job.queue == queue
                        && job.state == JobState::Failed
                        && job.finished_at.is_some_and(|at| at < failed_cutoff)
                })
                .map(|job| job.id),
        );
        let report = TrimReport {
            completed: completed_count,
            failed: doomed.len() as u64 - completed_count,
        };

        if !dry_run {
            for id in doomed {
                inner.jobs.remove(&id);
            }
        }
        Ok(report)
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        lock_timeout: Duration,
        max_stalled: u32,
    ) -> Result<Vec<JobRecord>, BrokerError> {
        let mut inner = self.connected()?;
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(lock_timeout).unwrap_or_else(|_| chrono::Duration::zero());

        let mut failed = Vec::new();
        for job in inner.jobs.values_mut().filter(|job| {
            job.queue == queue
                && job.state == JobState::Active
                && job.locked_at.is_some_and(|at| at < cutoff)
        }) {
            job.stalled_count += 1;
            job.locked_at = None;
            if job.stalled_count > max_stalled {
                job.state = JobState::Failed;
                job.last_error = Some(format!("job stalled more than {max_stalled} times"));
                job.finished_at = Some(now);
                failed.push(job.clone());
            } else {
                job.state = JobState::Stalled;
            }
        }
        Ok(failed)
    }
}
