use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    BackoffPolicy, Broker, BrokerError, FailureHandler, JobContext, JobExecution, JobHandle,
    JobHandler, JobOptions, JobRecord, JobStatus, NewJob, QueueCounts, QueueError, QueueName,
    RetentionPolicy, TrimReport,
};
use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub health_interval: Duration,
    pub reconnect_backoff: BackoffPolicy,
    pub reconnect_max_attempts: u32,
    pub poll_interval: Duration,
    pub stall_interval: Duration,
    pub job_timeout: Duration,
    pub max_stalled: u32,
    pub default_max_attempts: u32,
    pub job_backoff: BackoffPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            reconnect_backoff: BackoffPolicy::new(
                Duration::from_secs(1),
                Duration::from_secs(30),
            ),
            reconnect_max_attempts: 10,
            poll_interval: Duration::from_secs(1),
            stall_interval: Duration::from_secs(30),
            job_timeout: Duration::from_secs(300),
            max_stalled: 1,
            default_max_attempts: 3,
            job_backoff: BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(60)),
        }
    }
}

impl QueueSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            health_interval: config.queue_health_interval,
            reconnect_backoff: BackoffPolicy::new(
                config.queue_reconnect_base,
                config.queue_reconnect_max,
            ),
            reconnect_max_attempts: config.queue_reconnect_max_attempts,
            poll_interval: config.queue_poll_interval,
            stall_interval: config.queue_health_interval,
            job_timeout: config.job_timeout,
            max_stalled: config.job_max_stalled_count,
            default_max_attempts: config.job_max_attempts,
            job_backoff: BackoffPolicy::new(config.job_backoff_base, config.job_backoff_max),
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    initialized: bool,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub ready: bool,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

/// Owns the broker connection state and every queue loop.
///
/// Callers get [`QueueError::NotReady`] while the broker is down. A background
/// health loop pings the broker on a fixed interval and, once it is marked
/// down, reconnects with capped exponential backoff. A cycle that exhausts
/// `reconnect_max_attempts` gives up until the next health tick starts a new
/// one.
pub struct QueueManager {
    broker: Arc<dyn Broker>,
    settings: QueueSettings,
    state: Mutex<ConnectionState>,
    failure_handlers: RwLock<HashMap<QueueName, Vec<Arc<dyn FailureHandler>>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn Broker>, settings: QueueSettings) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            broker,
            settings,
            state: Mutex::new(ConnectionState::default()),
            failure_handlers: RwLock::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    pub fn is_ready(&self) -> bool {
        self.state().initialized
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state();
        ConnectionSnapshot {
            ready: state.initialized,
            reconnect_attempts: state.reconnect_attempts,
            last_error: state.last_error.clone(),
        }
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Connects to the broker and verifies every queue.
    pub async fn initialize(&self) -> Result<(), BrokerError> {
        let outcome = match self.broker.connect().await {
            Ok(()) => self.health_check().await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                let mut state = self.state();
                state.initialized = true;
                state.reconnect_attempts = 0;
                state.last_error = None;
                info!("queue manager initialized");
                Ok(())
            }
            Err(err) => {
                self.mark_down(&err);
                Err(err)
            }
        }
    }

    /// Pings the broker and confirms all queues report ready.
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        self.broker.ping().await?;
        for queue in QueueName::ALL {
            if !self.broker.queue_ready(queue).await? {
                return Err(BrokerError::Unavailable(format!("queue {queue} is not ready")));
            }
        }
        Ok(())
    }

    /// Initializes (failures are retried in the background) and starts the
    /// health loop.
    pub async fn start(self: &Arc<Self>) {
        if let Err(err) = self.initialize().await {
            warn!(error = %err, "queue broker unavailable at startup; reconnecting in background");
        }
        let manager = Arc::clone(self);
        self.track(tokio::spawn(async move { manager.health_loop().await }));
    }

    /// Signals every loop to stop and waits for in-flight jobs to drain.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "queue task ended abnormally");
            }
        }
        let mut state = self.state();
        state.initialized = false;
        state.last_error = Some("queue manager stopped".into());
        info!("queue manager stopped");
    }

    fn mark_down(&self, err: &BrokerError) {
        let mut state = self.state();
        if state.initialized {
            warn!(error = %err, "queue broker marked unavailable");
        }
        state.initialized = false;
        state.last_error = Some(err.to_string());
    }

    fn ensure_ready(&self) -> Result<(), QueueError> {
        let state = self.state();
        if state.initialized {
            return Ok(());
        }
        let reason = state
            .last_error
            .clone()
            .unwrap_or_else(|| "queue manager is not initialized".to_string());
        Err(QueueError::NotReady(reason))
    }

    fn observe<T>(&self, result: Result<T, BrokerError>) -> Result<T, QueueError> {
        result.map_err(|err| {
            if let BrokerError::Unavailable(_) = err {
                self.mark_down(&err);
                return QueueError::NotReady(err.to_string());
            }
            QueueError::from(err)
        })
    }

    async fn health_loop(self: Arc<Self>) {
        let mut shutdown = self.subscribe_shutdown();
        let mut ticker = time::interval(self.settings.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if self.is_ready() {
                match self.health_check().await {
                    Ok(()) => debug!("queue health check passed"),
                    Err(err) => {
                        warn!(error = %err, "queue health check failed");
                        self.mark_down(&err);
                    }
                }
            }
            if !self.is_ready() {
                self.reconnect(&mut shutdown).await;
            }
        }
    }

    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            let attempt = {
                let mut state = self.state();
                state.reconnect_attempts += 1;
                state.reconnect_attempts
            };
            if attempt > self.settings.reconnect_max_attempts {
                error!(
                    attempts = self.settings.reconnect_max_attempts,
                    "queue broker reconnect exhausted; waiting for next health check"
                );
                self.state().reconnect_attempts = 0;
                return false;
            }

            let delay = self.settings.reconnect_backoff.delay_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to queue broker");
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = shutdown.changed() => return false,
            }

            match self.initialize().await {
                Ok(()) => {
                    info!(attempt, "queue broker reconnected");
                    return true;
                }
                Err(err) => warn!(attempt, error = %err, "queue broker reconnect failed"),
            }
        }
    }

    pub async fn submit(
        &self,
        queue: QueueName,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        self.ensure_ready()?;

        let delay = options
            .delay
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .unwrap_or_else(chrono::Duration::zero);
        let job = NewJob {
            queue,
            job_key: options
                .job_key
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            job_type: job_type.to_string(),
            payload,
            priority: options.priority,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.settings.default_max_attempts)
                .max(1),
            run_after: Utc::now() + delay,
        };

        let (record, created) = self.observe(self.broker.add(job).await)?;
        if created {
            info!(
                queue = %queue,
                job_id = %record.id,
                job_key = %record.job_key,
                job_type = %record.job_type,
                "job submitted"
            );
        } else {
            debug!(queue = %queue, job_key = %record.job_key, "job already queued");
        }

        Ok(JobHandle {
            job_id: record.id,
            job_key: record.job_key,
            queue,
            created,
        })
    }

    pub async fn get_status(
        &self,
        queue: QueueName,
        job_key: &str,
    ) -> Result<Option<JobStatus>, QueueError> {
        self.ensure_ready()?;
        let job = self.observe(self.broker.find(queue, job_key).await)?;
        Ok(job.map(|job| job.status()))
    }

    pub async fn pause(&self, queue: QueueName) -> Result<(), QueueError> {
        self.ensure_ready()?;
        self.observe(self.broker.set_paused(queue, true).await)?;
        info!(queue = %queue, "queue paused");
        Ok(())
    }

    pub async fn resume(&self, queue: QueueName) -> Result<(), QueueError> {
        self.ensure_ready()?;
        self.observe(self.broker.set_paused(queue, false).await)?;
        info!(queue = %queue, "queue resumed");
        Ok(())
    }

    pub async fn stats(&self) -> Result<BTreeMap<QueueName, QueueCounts>, QueueError> {
        self.ensure_ready()?;
        let mut stats = BTreeMap::new();
        for queue in QueueName::ALL {
            let counts = self.observe(self.broker.counts(queue).await)?;
            stats.insert(queue, counts);
        }
        Ok(stats)
    }

    /// Trims finished-job history on every queue.
    pub async fn cleanup_completed(
        &self,
        policy: &RetentionPolicy,
        dry_run: bool,
    ) -> Result<TrimReport, QueueError> {
        self.ensure_ready()?;
        let mut report = TrimReport::default();
        for queue in QueueName::ALL {
            let trimmed = self.observe(self.broker.trim(queue, policy, dry_run).await)?;
            report = report.merge(trimmed);
        }
        info!(
            completed = report.completed,
            failed = report.failed,
            dry_run,
            "trimmed job history"
        );
        Ok(report)
    }

    pub(crate) async fn report_progress(&self, job_id: Uuid, percent: u8) -> Result<(), QueueError> {
        self.ensure_ready()?;
        self.observe(self.broker.update_progress(job_id, percent).await)
    }

    pub fn on_failure(&self, queue: QueueName, handler: Arc<dyn FailureHandler>) {
        self.failure_handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(queue)
            .or_default()
            .push(handler);
    }

    /// Starts a processing loop for `handler.job_type()` on `queue` with up
    /// to `concurrency` jobs in flight, plus the queue's stall sweep.
    pub fn register_processor(
        self: &Arc<Self>,
        queue: QueueName,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) {
        let manager = Arc::clone(self);
        self.track(tokio::spawn(async move {
            manager.run_processor(queue, concurrency, handler).await
        }));
        let manager = Arc::clone(self);
        self.track(tokio::spawn(async move { manager.run_stall_sweep(queue).await }));
    }

    async fn run_processor(
        self: Arc<Self>,
        queue: QueueName,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) {
        let concurrency = concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let job_types = vec![handler.job_type().to_string()];
        let mut shutdown = self.subscribe_shutdown();
        info!(queue = %queue, job_type = handler.job_type(), concurrency, "processor started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let reserved = if self.is_ready() {
                self.observe(self.broker.reserve(queue, &job_types).await)
            } else {
                Ok(None)
            };

            match reserved {
                Ok(Some(job)) => {
                    let manager = Arc::clone(&self);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        manager.execute(queue, handler, job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                }
                Err(err) => {
                    drop(permit);
                    warn!(queue = %queue, error = %err, "failed to reserve job");
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        // in-flight jobs hold permits; wait for them before reporting stopped
        let _ = permits.acquire_many(concurrency as u32).await;
        info!(queue = %queue, "processor stopped");
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = time::sleep(self.settings.poll_interval) => true,
            _ = shutdown.changed() => false,
        }
    }

    async fn execute(self: Arc<Self>, queue: QueueName, handler: Arc<dyn JobHandler>, job: JobRecord) {
        let job_id = job.id;
        let attempts = job.attempts;
        let max_attempts = job.max_attempts;
        debug!(queue = %queue, job_id = %job_id, attempt = attempts, "job started");

        let ctx = JobContext::new(job, Arc::clone(&self));
        let outcome = match time::timeout(self.settings.job_timeout, handler.handle(ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => JobExecution::retry(format!(
                "job timed out after {}s",
                self.settings.job_timeout.as_secs()
            )),
        };

        let recorded = match outcome {
            JobExecution::Success(result) => {
                info!(queue = %queue, job_id = %job_id, "job completed");
                self.broker.complete(job_id, result).await
            }
            JobExecution::Retry { delay, error } if attempts < max_attempts => {
                let delay = delay.unwrap_or_else(|| self.settings.job_backoff.delay_for(attempts));
                warn!(
                    queue = %queue,
                    job_id = %job_id,
                    attempt = attempts,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "job will retry"
                );
                let run_after = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                self.broker.retry(job_id, run_after, &error).await
            }
            JobExecution::Retry { error, .. } | JobExecution::Failed { error } => {
                error!(queue = %queue, job_id = %job_id, attempt = attempts, %error, "job failed");
                match self.broker.fail(job_id, &error).await {
                    Ok(failed) => {
                        self.run_failure_handlers(queue, &failed, &error).await;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        };

        if let Err(err) = self.observe(recorded) {
            error!(queue = %queue, job_id = %job_id, error = %err, "failed to record job outcome");
        }
    }

    async fn run_failure_handlers(&self, queue: QueueName, job: &JobRecord, error: &str) {
        let handlers = self
            .failure_handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&queue)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler.on_failed(job, error).await;
        }
    }

    async fn run_stall_sweep(self: Arc<Self>, queue: QueueName) {
        let lock_timeout = self.settings.job_timeout * 2;
        let mut shutdown = self.subscribe_shutdown();
        let mut ticker = time::interval(self.settings.stall_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if !self.is_ready() {
                continue;
            }

            let swept = self.broker
                .recover_stalled(queue, lock_timeout, self.settings.max_stalled)
                .await;
            match self.observe(swept) {
                Ok(failed) => {
                    for job in failed {
                        let error = job.last_error.clone().unwrap_or_default();
                        warn!(queue = %queue, job_id = %job.id, %error, "stalled job failed");
                        self.run_failure_handlers(queue, &job, &error).await;
                    }
                }
                Err(err) => warn!(queue = %queue, error = %err, "stall sweep failed"),
            }
        }
    }
}
