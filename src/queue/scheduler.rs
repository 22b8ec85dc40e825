use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{JobOptions, QueueError, QueueManager, QueueName};

/// A recurring submission: every `every`, a fresh one-shot job is queued.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub name: String,
    pub queue: QueueName,
    pub job_type: String,
    pub every: Duration,
    pub payload: Value,
}

/// Drives [`ScheduleEntry`] ticks until the queue manager shuts down. Ticks
/// that land while the manager is not ready are skipped, not buffered.
pub struct CleanupScheduler {
    manager: Arc<QueueManager>,
    entries: Vec<ScheduleEntry>,
}

impl CleanupScheduler {
    pub fn new(manager: Arc<QueueManager>, entries: Vec<ScheduleEntry>) -> Self {
        Self { manager, entries }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn start(self) -> Vec<JoinHandle<()>> {
        self.entries
            .into_iter()
            .map(|entry| {
                let manager = Arc::clone(&self.manager);
                tokio::spawn(run_entry(manager, entry))
            })
            .collect()
    }
}

/// `schedule-{name}-{window}`, where the window is the tick period containing
/// `now`. Every worker process derives the same key for the same tick.
pub fn schedule_key(entry: &ScheduleEntry, now: DateTime<Utc>) -> String {
    let period = entry.every.as_secs().max(1) as i64;
    format!("schedule-{}-{}", entry.name, now.timestamp().div_euclid(period))
}

pub(crate) async fn fire(
    manager: &QueueManager,
    entry: &ScheduleEntry,
    now: DateTime<Utc>,
) -> Result<(), QueueError> {
    let job_key = schedule_key(entry, now);
    if let Some(existing) = manager.get_status(entry.queue, &job_key).await? {
        debug!(
            schedule = %entry.name,
            job_key = %job_key,
            state = %existing.state,
            "tick already submitted by another process"
        );
        return Ok(());
    }

    let handle = manager
        .submit(
            entry.queue,
            &entry.job_type,
            entry.payload.clone(),
            JobOptions::keyed(job_key),
        )
        .await?;
    if handle.created {
        info!(schedule = %entry.name, job_id = %handle.job_id, "scheduled job submitted");
    }
    Ok(())
}

async fn run_entry(manager: Arc<QueueManager>, entry: ScheduleEntry) {
    let mut shutdown = manager.subscribe_shutdown();
    let mut ticker = time::interval_at(Instant::now() + entry.every, entry.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(schedule = %entry.name, every_secs = entry.every.as_secs(), "schedule armed");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        match fire(&manager, &entry, Utc::now()).await {
            Ok(()) => {}
            Err(QueueError::NotReady(reason)) => {
                warn!(schedule = %entry.name, %reason, "queue not ready; skipping scheduled run")
            }
            Err(err) => warn!(schedule = %entry.name, error = %err, "scheduled submit failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::queue::{Broker, MemoryBroker, QueueSettings};

    fn entry(every: Duration) -> ScheduleEntry {
        ScheduleEntry {
            name: "temp_files".into(),
            queue: QueueName::Cleanup,
            job_type: "cleanup".into(),
            every,
            payload: json!({"type": "temp_files"}),
        }
    }

    #[tokio::test]
    async fn each_tick_submits_a_fresh_job() {
        let broker = Arc::new(MemoryBroker::new());
        let manager = QueueManager::new(broker.clone(), QueueSettings::default());
        manager.initialize().await.unwrap();
        let hourly = entry(Duration::from_secs(3600));
        let first_tick = Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 5).unwrap();

        fire(&manager, &hourly, first_tick).await.unwrap();
        fire(&manager, &hourly, first_tick + chrono::Duration::hours(1))
            .await
            .unwrap();

        let jobs = broker.jobs();
        assert_eq!(jobs.len(), 2);
        assert_ne!(jobs[0].job_key, jobs[1].job_key);
        assert_eq!(jobs[0].payload, json!({"type": "temp_files"}));
    }

    #[tokio::test]
    async fn processes_firing_the_same_tick_share_one_job() {
        let broker = Arc::new(MemoryBroker::new());
        let manager = QueueManager::new(broker.clone(), QueueSettings::default());
        manager.initialize().await.unwrap();
        let hourly = entry(Duration::from_secs(3600));
        let tick = Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 5).unwrap();

        fire(&manager, &hourly, tick).await.unwrap();
        fire(&manager, &hourly, tick + chrono::Duration::seconds(3))
            .await
            .unwrap();
        assert_eq!(broker.jobs().len(), 1);

        // still one job once the first run has finished
        let job = broker
            .reserve(QueueName::Cleanup, &["cleanup".to_string()])
            .await
            .unwrap()
            .unwrap();
        broker.complete(job.id, None).await.unwrap();
        fire(&manager, &hourly, tick + chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(broker.jobs().len(), 1);
        assert_eq!(broker.jobs()[0].job_key, schedule_key(&hourly, tick));
    }

    #[tokio::test]
    async fn skips_ticks_while_not_ready() {
        let broker = Arc::new(MemoryBroker::new());
        let manager = QueueManager::new(broker.clone(), QueueSettings::default());

        let handles = CleanupScheduler::new(manager.clone(), vec![entry(Duration::from_millis(10))])
            .start();
        time::sleep(Duration::from_millis(50)).await;
        assert!(broker.jobs().is_empty());

        manager.stop().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
