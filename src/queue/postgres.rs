use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde_json::Value;
use tokio::task;
use uuid::Uuid;

use super::{
    Broker, BrokerError, JobRecord, JobState, NewJob, QueueCounts, QueueName, RetentionPolicy,
    TrimReport,
};
use crate::db::PgPool;
use crate::models::{Job, NewJobRow};
use crate::schema::{jobs, queue_controls};

const LIVE_STATES: &[&str] = &["waiting", "active", "stalled"];
const RESERVABLE_STATES: &[&str] = &["waiting", "stalled"];

/// Jobs table broker. Reservation uses `FOR UPDATE SKIP LOCKED` so several
/// worker processes can poll the same queue.
#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, BrokerError> + Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|err| BrokerError::Backend(format!("broker task failed: {err}")))?
    }
}

impl From<DieselError> for BrokerError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::NotFound => BrokerError::NotFound,
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                BrokerError::Unavailable(info.message().to_string())
            }
            other => BrokerError::Backend(other.to_string()),
        }
    }
}

fn utc(value: NaiveDateTime) -> DateTime<Utc> {
    value.and_utc()
}

fn naive(value: DateTime<Utc>) -> NaiveDateTime {
    value.naive_utc()
}

fn non_negative(value: i32) -> u32 {
    value.max(0) as u32
}

impl TryFrom<Job> for JobRecord {
    type Error = BrokerError;

    fn try_from(row: Job) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: row.id,
            queue: row
                .queue
                .parse()
                .map_err(|_| BrokerError::Backend(format!("unknown queue {}", row.queue)))?,
            job_key: row.job_key,
            job_type: row.job_type,
            payload: row.payload,
            state: row.status.parse()?,
            priority: row.priority,
            attempts: non_negative(row.attempts),
            max_attempts: non_negative(row.max_attempts),
            stalled_count: non_negative(row.stalled_count),
            progress: row.progress.clamp(0, 100) as u8,
            run_after: utc(row.run_after),
            locked_at: row.locked_at.map(utc),
            last_error: row.last_error,
            result: row.result,
            finished_at: row.finished_at.map(utc),
            created_at: utc(row.created_at),
        })
    }
}

fn load_job(conn: &mut PgConnection, id: Uuid) -> Result<JobRecord, BrokerError> {
    jobs::table.find(id).first::<Job>(conn)?.try_into()
}

fn find_live(
    conn: &mut PgConnection,
    queue: QueueName,
    job_key: &str,
) -> Result<Option<Job>, BrokerError> {
    Ok(jobs::table
        .filter(jobs::queue.eq(queue.as_str()))
        .filter(jobs::job_key.eq(job_key))
        .filter(jobs::status.eq_any(LIVE_STATES))
        .first::<Job>(conn)
        .optional()?)
}

fn ensure_updated(updated: usize) -> Result<(), BrokerError> {
    if updated == 0 {
        Err(BrokerError::NotFound)
    } else {
        Ok(())
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.run(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            let now = Utc::now().naive_utc();
            let rows: Vec<_> = QueueName::ALL
                .iter()
                .map(|queue| {
                    (
                        queue_controls::queue.eq(queue.as_str()),
                        queue_controls::paused.eq(false),
                        queue_controls::updated_at.eq(now),
                    )
                })
                .collect();
            diesel::insert_into(queue_controls::table)
                .values(rows)
                .on_conflict_do_nothing()
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.run(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn queue_ready(&self, queue: QueueName) -> Result<bool, BrokerError> {
        self.run(move |conn| {
            let count: i64 = queue_controls::table
                .filter(queue_controls::queue.eq(queue.as_str()))
                .count()
                .get_result(conn)?;
            Ok(count == 1)
        })
        .await
    }

    async fn add(&self, job: NewJob) -> Result<(JobRecord, bool), BrokerError> {
        self.run(move |conn| {
            conn.transaction(|conn| {
                let row = NewJobRow {
                    id: Uuid::new_v4(),
                    queue: job.queue.as_str().to_string(),
                    job_key: job.job_key.clone(),
                    job_type: job.job_type,
                    payload: job.payload,
                    status: JobState::Waiting.as_str().to_string(),
                    priority: job.priority,
                    max_attempts: job.max_attempts as i32,
                    run_after: naive(job.run_after),
                };
                // the partial unique index on live keys turns a duplicate into a no-op
                let inserted = diesel::insert_into(jobs::table)
                    .values(&row)
                    .on_conflict_do_nothing()
                    .execute(conn)?;

                if inserted == 1 {
                    return Ok((load_job(conn, row.id)?, true));
                }
                let existing = find_live(conn, job.queue, &job.job_key)?.ok_or_else(|| {
                    BrokerError::Backend("job insert conflicted without a live job".into())
                })?;
                Ok((existing.try_into()?, false))
            })
        })
        .await
    }

    async fn find(
        &self,
        queue: QueueName,
        job_key: &str,
    ) -> Result<Option<JobRecord>, BrokerError> {
        let job_key = job_key.to_string();
        self.run(move |conn| {
            jobs::table
                .filter(jobs::queue.eq(queue.as_str()))
                .filter(jobs::job_key.eq(&job_key))
                .order(jobs::created_at.desc())
                .first::<Job>(conn)
                .optional()?
                .map(JobRecord::try_from)
                .transpose()
        })
        .await
    }

    async fn reserve(
        &self,
        queue: QueueName,
        job_types: &[String],
    ) -> Result<Option<JobRecord>, BrokerError> {
        let job_types = job_types.to_vec();
        self.run(move |conn| {
            let now = Utc::now().naive_utc();

            conn.transaction(|conn| {
                let paused = queue_controls::table
                    .filter(queue_controls::queue.eq(queue.as_str()))
                    .select(queue_controls::paused)
                    .first::<bool>(conn)
                    .optional()?
                    .unwrap_or(false);
                if paused {
                    return Ok(None);
                }

                let job_opt = jobs::table
                    .filter(jobs::queue.eq(queue.as_str()))
                    .filter(jobs::status.eq_any(RESERVABLE_STATES))
                    .filter(jobs::run_after.le(now))
                    .filter(jobs::job_type.eq_any(job_types))
                    .order((jobs::priority.desc(), jobs::run_after.asc()))
                    .for_update()
                    .skip_locked()
                    .first::<Job>(conn)
                    .optional()?;

                let Some(job) = job_opt else {
                    return Ok(None);
                };
                diesel::update(jobs::table.find(job.id))
                    .set((
                        jobs::status.eq(JobState::Active.as_str()),
                        jobs::attempts.eq(job.attempts + 1),
                        jobs::locked_at.eq(Some(now)),
                        jobs::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                load_job(conn, job.id).map(Some)
            })
        })
        .await
    }

    async fn complete(&self, id: Uuid, result: Option<Value>) -> Result<(), BrokerError> {
        self.run(move |conn| {
            let now = Utc::now().naive_utc();
            let updated = diesel::update(jobs::table.find(id))
                .set((
                    jobs::status.eq(JobState::Completed.as_str()),
                    jobs::progress.eq(100),
                    jobs::result.eq(result),
                    jobs::locked_at.eq::<Option<NaiveDateTime>>(None),
                    jobs::finished_at.eq(Some(now)),
                    jobs::updated_at.eq(now),
                ))
                .execute(conn)?;
            ensure_updated(updated)
        })
        .await
    }

    async fn retry(
        &self,
        id: Uuid,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError> {
        let error = error.to_string();
        self.run(move |conn| {
            let updated = diesel::update(jobs::table.find(id))
                .set((
                    jobs::status.eq(JobState::Waiting.as_str()),
                    jobs::run_after.eq(naive(run_after)),
                    jobs::last_error.eq(Some(error)),
                    jobs::locked_at.eq::<Option<NaiveDateTime>>(None),
                    jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            ensure_updated(updated)
        })
        .await
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<JobRecord, BrokerError> {
        let error = error.to_string();
        self.run(move |conn| {
            let now = Utc::now().naive_utc();
            let updated = diesel::update(jobs::table.find(id))
                .set((
                    jobs::status.eq(JobState::Failed.as_str()),
                    jobs::last_error.eq(Some(error)),
                    jobs::locked_at.eq::<Option<NaiveDateTime>>(None),
                    jobs::finished_at.eq(Some(now)),
                    jobs::updated_at.eq(now),
                ))
                .execute(conn)?;
            ensure_updated(updated)?;
            load_job(conn, id)
        })
        .await
    }

    async fn update_progress(&self, id: Uuid, progress: u8) -> Result<(), BrokerError> {
        self.run(move |conn| {
            let updated = diesel::update(jobs::table.find(id))
                .set((
                    jobs::progress.eq(i32::from(progress.min(100))),
                    jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            ensure_updated(updated)
        })
        .await
    }

    async fn set_paused(&self, queue: QueueName, paused: bool) -> Result<(), BrokerError> {
        self.run(move |conn| {
            let now = Utc::now().naive_utc();
            diesel::insert_into(queue_controls::table)
                .values((
                    queue_controls::queue.eq(queue.as_str()),
                    queue_controls::paused.eq(paused),
                    queue_controls::updated_at.eq(now),
                ))
                .on_conflict(queue_controls::queue)
                .do_update()
                .set((
                    queue_controls::paused.eq(paused),
                    queue_controls::updated_at.eq(now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, BrokerError> {
        self.run(move |conn| {
            let now = Utc::now().naive_utc();
            let grouped: Vec<(String, i64)> = jobs::table
                .filter(jobs::queue.eq(queue.as_str()))
                .group_by(jobs::status)
                .select((jobs::status, count_star()))
                .load(conn)?;
            let delayed: i64 = jobs::table
                .filter(jobs::queue.eq(queue.as_str()))
                .filter(jobs::status.eq(JobState::Waiting.as_str()))
                .filter(jobs::run_after.gt(now))
                .count()
                .get_result(conn)?;
            let paused = queue_controls::table
                .filter(queue_controls::queue.eq(queue.as_str()))
                .select(queue_controls::paused)
                .first::<bool>(conn)
                .optional()?
                .unwrap_or(false);

            let mut counts = QueueCounts {
                paused,
                delayed: delayed.max(0) as u64,
                ..QueueCounts::default()
            };
            for (status, count) in grouped {
                let count = count.max(0) as u64;
                match status.parse::<JobState>()? {
                    JobState::Waiting => {
                        counts.waiting = count.saturating_sub(counts.delayed)
                    }
                    JobState::Active => counts.active = count,
                    JobState::Completed => counts.completed = count,
                    JobState::Failed => counts.failed = count,
                    JobState::Stalled => counts.stalled = count,
                    JobState::Delayed => {}
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn trim(
        &self,
        queue: QueueName,
        policy: &RetentionPolicy,
        dry_run: bool,
    ) -> Result<TrimReport, BrokerError> {
        let policy = *policy;
        self.run(move |conn| {
            let failed_cutoff = Utc::now()
                - chrono::Duration::from_std(policy.failed_max_age)
                    .unwrap_or_else(|_| chrono::Duration::days(7));

            conn.transaction(|conn| {
                let completed: Vec<Uuid> = jobs::table
                    .filter(jobs::queue.eq(queue.as_str()))
                    .filter(jobs::status.eq(JobState::Completed.as_str()))
                    .order(jobs::finished_at.desc())
                    .offset(policy.keep_completed as i64)
                    .select(jobs::id)
                    .load(conn)?;
                let failed: Vec<Uuid> = jobs::table
                    .filter(jobs::queue.eq(queue.as_str()))
                    .filter(jobs::status.eq(JobState::Failed.as_str()))
                    .filter(jobs::finished_at.lt(naive(failed_cutoff)))
                    .select(jobs::id)
                    .load(conn)?;

                let report = TrimReport {
                    completed: completed.len() as u64,
                    failed: failed.len() as u64,
                };
                if !dry_run {
                    diesel::delete(jobs::table.filter(jobs::id.eq_any(completed)))
                        .execute(conn)?;
                    diesel::delete(jobs::table.filter(jobs::id.eq_any(failed))).execute(conn)?;
                }
                Ok(report)
            })
        })
        .await
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        lock_timeout: Duration,
        max_stalled: u32,
    ) -> Result<Vec<JobRecord>, BrokerError> {
        self.run(move |conn| {
            let now = Utc::now();
            let cutoff = now
                - chrono::Duration::from_std(lock_timeout)
                    .unwrap_or_else(|_| chrono::Duration::zero());

            conn.transaction(|conn| {
                let expired: Vec<Job> = jobs::table
                    .filter(jobs::queue.eq(queue.as_str()))
                    .filter(jobs::status.eq(JobState::Active.as_str()))
                    .filter(jobs::locked_at.lt(naive(cutoff)))
                    .for_update()
                    .skip_locked()
                    .load(conn)?;

                let mut failed = Vec::new();
                for job in expired {
                    let stalled_count = job.stalled_count + 1;
                    let exhausted = non_negative(stalled_count) > max_stalled;
                    let (status, error, finished_at) = if exhausted {
                        (
                            JobState::Failed,
                            Some(format!("job stalled more than {max_stalled} times")),
                            Some(naive(now)),
                        )
                    } else {
                        (JobState::Stalled, job.last_error.clone(), None)
                    };

                    diesel::update(jobs::table.find(job.id))
                        .set((
                            jobs::status.eq(status.as_str()),
                            jobs::stalled_count.eq(stalled_count),
                            jobs::last_error.eq(error),
                            jobs::locked_at.eq::<Option<NaiveDateTime>>(None),
                            jobs::finished_at.eq(finished_at),
                            jobs::updated_at.eq(naive(now)),
                        ))
                        .execute(conn)?;
                    if exhausted {
                        failed.push(load_job(conn, job.id)?);
                    }
                }
                Ok(failed)
            })
        })
        .await
    }
}
