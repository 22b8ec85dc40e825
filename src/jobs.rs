//! Job types, payloads and the submission helpers used by the HTTP layer,
//! the workers and the maintenance binary.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::queue::{
    JobHandle, JobOptions, JobStatus, QueueCounts, QueueError, QueueManager, QueueName,
    ScheduleEntry,
};

pub const JOB_GENERATE_DOCUMENT: &str = "generate-document";
pub const JOB_UPLOAD_TO_CRM: &str = "upload-to-crm";
pub const JOB_CLEANUP: &str = "cleanup";

pub fn generation_job_key(document_id: Uuid) -> String {
    format!("doc-{document_id}")
}

pub fn upload_job_key(document_id: Uuid) -> String {
    format!("upload-{document_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub document_id: Uuid,
    pub template_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub variables: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPayload {
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupKind {
    TempFiles,
    OldDocuments,
    CompletedJobs,
    AuditLogs,
    StaleDocuments,
}

impl CleanupKind {
    pub fn default_hours(&self) -> u64 {
        match self {
            CleanupKind::TempFiles => 24,
            CleanupKind::OldDocuments => 168,
            CleanupKind::CompletedJobs => 168,
            CleanupKind::AuditLogs => 90 * 24,
            CleanupKind::StaleDocuments => 24,
        }
    }
}

impl std::str::FromStr for CleanupKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(value.to_string()))
            .map_err(|_| format!("unknown cleanup type: {value}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupPayload {
    #[serde(rename = "type")]
    pub kind: CleanupKind,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub older_than_hours: Option<u64>,
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
    /// Completed jobs kept per queue by `completed_jobs`.
    #[serde(default)]
    pub keep_completed: Option<u64>,
}

impl CleanupPayload {
    pub fn new(kind: CleanupKind) -> Self {
        Self {
            kind,
            dry_run: false,
            older_than_hours: None,
            tenant_id: None,
            keep_completed: None,
        }
    }

    pub fn hours(&self) -> u64 {
        self.older_than_hours
            .unwrap_or_else(|| self.kind.default_hours())
    }
}

pub async fn enqueue_generation(
    queue: &QueueManager,
    payload: &GenerationPayload,
) -> Result<JobHandle, QueueError> {
    queue
        .submit(
            QueueName::DocumentGeneration,
            JOB_GENERATE_DOCUMENT,
            serde_json::to_value(payload)?,
            JobOptions::keyed(generation_job_key(payload.document_id)),
        )
        .await
}

pub async fn enqueue_upload(
    queue: &QueueManager,
    payload: &UploadPayload,
) -> Result<JobHandle, QueueError> {
    queue
        .submit(
            QueueName::CrmUpload,
            JOB_UPLOAD_TO_CRM,
            serde_json::to_value(payload)?,
            JobOptions::keyed(upload_job_key(payload.document_id)),
        )
        .await
}

/// Latest generation job for the document, if one was ever submitted.
pub async fn get_document_job_status(
    queue: &QueueManager,
    document_id: Uuid,
) -> Result<Option<JobStatus>, QueueError> {
    queue
        .get_status(
            QueueName::DocumentGeneration,
            &generation_job_key(document_id),
        )
        .await
}

/// Latest upload job for the document.
pub async fn get_upload_job_status(
    queue: &QueueManager,
    document_id: Uuid,
) -> Result<Option<JobStatus>, QueueError> {
    queue
        .get_status(QueueName::CrmUpload, &upload_job_key(document_id))
        .await
}

pub async fn get_queue_stats(
    queue: &QueueManager,
) -> Result<BTreeMap<QueueName, QueueCounts>, QueueError> {
    queue.stats().await
}

pub async fn pause_queue(queue: &QueueManager, name: QueueName) -> Result<(), QueueError> {
    queue.pause(name).await
}

pub async fn resume_queue(queue: &QueueManager, name: QueueName) -> Result<(), QueueError> {
    queue.resume(name).await
}

pub async fn schedule_cleanup(
    queue: &QueueManager,
    payload: &CleanupPayload,
) -> Result<JobHandle, QueueError> {
    queue
        .submit(
            QueueName::Cleanup,
            JOB_CLEANUP,
            serde_json::to_value(payload)?,
            JobOptions::default(),
        )
        .await
}

/// Recurring cleanup: temp files hourly, job history every six hours, failed
/// documents daily and audit rows weekly.
pub fn default_cleanup_schedule() -> Vec<ScheduleEntry> {
    const HOUR: u64 = 3600;
    let entry = |name: &str, every: u64, payload: CleanupPayload| ScheduleEntry {
        name: name.to_string(),
        queue: QueueName::Cleanup,
        job_type: JOB_CLEANUP.to_string(),
        every: Duration::from_secs(every),
        payload: serde_json::to_value(&payload).unwrap_or(Value::Null),
    };

    let mut completed_jobs = CleanupPayload::new(CleanupKind::CompletedJobs);
    completed_jobs.keep_completed = Some(50);
    completed_jobs.older_than_hours = Some(7 * 24);

    vec![
        entry("temp_files", HOUR, CleanupPayload::new(CleanupKind::TempFiles)),
        entry("completed_jobs", 6 * HOUR, completed_jobs),
        entry(
            "old_documents",
            24 * HOUR,
            CleanupPayload::new(CleanupKind::OldDocuments),
        ),
        entry(
            "audit_logs",
            7 * 24 * HOUR,
            CleanupPayload::new(CleanupKind::AuditLogs),
        ),
    ]
}
