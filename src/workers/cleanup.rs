use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    jobs::{get_document_job_status, CleanupKind, CleanupPayload, JOB_CLEANUP},
    models::DocumentStatus,
    queue::{JobContext, JobExecution, JobHandler, RetentionPolicy},
    state::AppState,
};

use super::{fail_document, PipelineError};

const ABANDONED: &str = "processing abandoned";
// a century; larger ages clamp here
const MAX_AGE_HOURS: i64 = 100 * 365 * 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub items_processed: u64,
    /// Always zero on a dry run.
    pub items_deleted: u64,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

pub struct CleanupJob {
    state: AppState,
}

impl CleanupJob {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl JobHandler for CleanupJob {
    fn job_type(&self) -> &'static str {
        JOB_CLEANUP
    }

    async fn handle(&self, ctx: JobContext) -> JobExecution {
        let payload: CleanupPayload = match ctx.payload() {
            Ok(payload) => payload,
            Err(err) => return JobExecution::failed(format!("invalid cleanup payload: {err}")),
        };

        match run_cleanup(&self.state, &payload).await {
            Ok(report) => match serde_json::to_value(report) {
                Ok(value) => JobExecution::Success(Some(value)),
                Err(_) => JobExecution::Success(None),
            },
            Err(err) => {
                warn!(kind = ?payload.kind, error = %err, "cleanup failed");
                err.into_execution()
            }
        }
    }
}

fn cutoff(hours: u64) -> NaiveDateTime {
    let hours = i64::try_from(hours).unwrap_or(i64::MAX).min(MAX_AGE_HOURS);
    (Utc::now() - chrono::Duration::hours(hours)).naive_utc()
}

/// Runs one cleanup pass. A dry run counts what would go without touching it.
pub async fn run_cleanup(
    state: &AppState,
    payload: &CleanupPayload,
) -> Result<CleanupReport, PipelineError> {
    let hours = payload.hours();
    let dry_run = payload.dry_run;
    let mut report = CleanupReport {
        dry_run,
        ..CleanupReport::default()
    };

    match payload.kind {
        CleanupKind::TempFiles => {
            let purge = state.files.cleanup_older_than(hours, dry_run).await?;
            report.items_processed = purge.matched;
            report.items_deleted = purge.removed;
            report.bytes_freed = purge.bytes;
        }
        CleanupKind::OldDocuments => {
            let documents = state
                .repo
                .failed_documents_before(cutoff(hours), payload.tenant_id)
                .await?;
            for document in documents {
                report.items_processed += 1;
                let size = document
                    .file_size
                    .and_then(|size| u64::try_from(size).ok())
                    .unwrap_or(0);
                if dry_run {
                    report.bytes_freed += size;
                    continue;
                }
                if let Some(path) = document.file_path.as_deref() {
                    state.files.delete(path).await?;
                    report.bytes_freed += size;
                }
                if state
                    .repo
                    .delete_document(document.tenant_id, document.id)
                    .await?
                {
                    report.items_deleted += 1;
                }
            }
        }
        CleanupKind::CompletedJobs => {
            let policy = RetentionPolicy {
                keep_completed: payload
                    .keep_completed
                    .unwrap_or(RetentionPolicy::default().keep_completed),
                failed_max_age: Duration::from_secs(hours.saturating_mul(3600)),
            };
            let trimmed = state.queue.cleanup_completed(&policy, dry_run).await?;
            report.items_processed = trimmed.total();
            if !dry_run {
                report.items_deleted = trimmed.total();
            }
        }
        CleanupKind::AuditLogs => {
            let before = cutoff(hours);
            if dry_run {
                report.items_processed = state
                    .repo
                    .count_audit_logs_before(before, payload.tenant_id)
                    .await?;
            } else {
                let deleted = state
                    .repo
                    .delete_audit_logs_before(before, payload.tenant_id)
                    .await?;
                report.items_processed = deleted;
                report.items_deleted = deleted;
            }
        }
        CleanupKind::StaleDocuments => {
            let documents = state
                .repo
                .stale_documents_before(cutoff(hours), payload.tenant_id)
                .await?;
            for document in documents {
                // a waiting, delayed or stalled job still owns the document
                let job = get_document_job_status(&state.queue, document.id).await?;
                if job.is_some_and(|job| job.state.is_live()) {
                    continue;
                }
                match document.status() {
                    Some(DocumentStatus::Processing) => {
                        report.items_processed += 1;
                        if !dry_run {
                            fail_document(state.repo.as_ref(), &document, ABANDONED).await?;
                        }
                    }
                    Some(DocumentStatus::Pending) => {
                        report.items_processed += 1;
                        if !dry_run
                            && state
                                .repo
                                .delete_document(document.tenant_id, document.id)
                                .await?
                        {
                            report.items_deleted += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    info!(
        kind = ?payload.kind,
        hours,
        dry_run,
        processed = report.items_processed,
        deleted = report.items_deleted,
        bytes_freed = report.bytes_freed,
        "cleanup finished"
    );
    Ok(report)
}
