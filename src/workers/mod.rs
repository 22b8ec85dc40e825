//! Queue handlers for the document pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::{
    crm::CrmError,
    models::{Document, DocumentStatus, NewAuditLog},
    queue::{JobExecution, QueueError, QueueName},
    render::RenderError,
    repository::{Repository, RepositoryError},
    state::AppState,
    storage::StorageError,
    variables::VariableError,
};

pub mod cleanup;
pub mod generate;
pub mod upload;

pub use cleanup::{run_cleanup, CleanupJob, CleanupReport};
pub use generate::{GenerateDocumentJob, GenerationFailureHandler};
pub use upload::UploadToCrmJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; retrying cannot help.
    Validation,
    NotFound,
    Transient,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    /// Upstream asked for this much time before the next attempt.
    pub retry_after: Option<Duration>,
}

impl PipelineError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind != ErrorKind::Transient
    }

    /// Terminal errors fail the job at once; transient ones go back to the
    /// queue's retry policy.
    pub fn into_execution(self) -> JobExecution {
        if self.is_terminal() {
            JobExecution::failed(self.message)
        } else {
            JobExecution::Retry {
                delay: self.retry_after,
                error: self.message,
            }
        }
    }
}

impl From<RepositoryError> for PipelineError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound => PipelineError::not_found("record not found"),
            err @ (RepositoryError::Conflict(_) | RepositoryError::InvalidTransition { .. }) => {
                PipelineError::validation(err.to_string())
            }
            other => PipelineError::transient(other.to_string()),
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(path) => PipelineError::not_found(format!("file not found: {path}")),
            err @ StorageError::InvalidPath(_) => PipelineError::validation(err.to_string()),
            other => PipelineError::transient(other.to_string()),
        }
    }
}

/// Every render failure is retried, including non-2xx answers.
impl From<RenderError> for PipelineError {
    fn from(value: RenderError) -> Self {
        PipelineError::transient(value.to_string())
    }
}

impl From<CrmError> for PipelineError {
    fn from(value: CrmError) -> Self {
        match value {
            CrmError::NotFound => PipelineError::not_found(value.to_string()),
            CrmError::RateLimited { retry_after_secs } => PipelineError {
                retry_after: retry_after_secs.map(Duration::from_secs),
                ..PipelineError::transient(value.to_string())
            },
            err if err.is_retryable() => PipelineError::transient(err.to_string()),
            err => PipelineError::validation(err.to_string()),
        }
    }
}

impl From<VariableError> for PipelineError {
    fn from(value: VariableError) -> Self {
        PipelineError::validation(value.to_string())
    }
}

impl From<QueueError> for PipelineError {
    fn from(value: QueueError) -> Self {
        match value {
            err @ (QueueError::UnknownQueue(_) | QueueError::Payload(_)) => {
                PipelineError::validation(err.to_string())
            }
            other => PipelineError::transient(other.to_string()),
        }
    }
}

/// Moves a document that never reached a terminal state to `FAILED`.
///
/// A `PENDING` document passes through `PROCESSING` first so the write
/// follows legal edges only. Terminal documents are left untouched.
pub(crate) async fn fail_document(
    repo: &dyn Repository,
    document: &Document,
    error: &str,
) -> Result<Option<Document>, RepositoryError> {
    let now = Utc::now().naive_utc();
    match document.status() {
        Some(DocumentStatus::Pending) => {
            repo.mark_processing(document.tenant_id, document.id, now)
                .await?;
        }
        Some(DocumentStatus::Processing) => {}
        _ => return Ok(None),
    }
    repo.mark_failed(document.tenant_id, document.id, error, now)
        .await
        .map(Some)
}

/// Audit rows are best effort; a lost entry never fails the job.
pub(crate) async fn audit(repo: &dyn Repository, entry: NewAuditLog) {
    let action = entry.action.clone();
    if let Err(err) = repo.append_audit(entry).await {
        warn!(%action, error = %err, "failed to write audit entry");
    }
}

/// `.pdf` file name derived from the document name.
pub(crate) fn pdf_file_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.to_ascii_lowercase().ends_with(".pdf") {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        "document.pdf".to_string()
    } else {
        format!("{trimmed}.pdf")
    }
}

/// Registers every processor and the generation failure handler on the
/// state's queue manager.
pub fn register_workers(state: &AppState) {
    let queue = &state.queue;
    let config = &state.config;

    queue.on_failure(
        QueueName::DocumentGeneration,
        Arc::new(GenerationFailureHandler::new(state.clone())),
    );
    queue.register_processor(
        QueueName::DocumentGeneration,
        config.generation_concurrency,
        Arc::new(GenerateDocumentJob::new(state.clone())),
    );
    queue.register_processor(
        QueueName::CrmUpload,
        config.upload_concurrency,
        Arc::new(UploadToCrmJob::new(state.clone())),
    );
    queue.register_processor(
        QueueName::Cleanup,
        config.cleanup_concurrency,
        Arc::new(CleanupJob::new(state.clone())),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_collaborator_errors() {
        let err = PipelineError::from(RepositoryError::NotFound);
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err = PipelineError::from(RenderError::Status {
            status: 400,
            body: "bad html".into(),
        });
        assert_eq!(err.kind, ErrorKind::Transient);

        let err = PipelineError::from(CrmError::RateLimited {
            retry_after_secs: Some(10),
        });
        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(err.retry_after, Some(Duration::from_secs(10)));

        let err = PipelineError::from(CrmError::Status {
            status: 400,
            body: "bad folder".into(),
        });
        assert_eq!(err.kind, ErrorKind::Validation);

        let err = PipelineError::from(VariableError::MissingRequired(vec!["deal.amount".into()]));
        assert!(err.is_terminal());
        assert!(err.message.contains("deal.amount"));
    }

    #[test]
    fn terminal_errors_skip_retry() {
        assert_eq!(
            PipelineError::validation("nope").into_execution(),
            JobExecution::failed("nope")
        );
        assert_eq!(
            PipelineError::transient("later").into_execution(),
            JobExecution::retry("later")
        );
    }

    #[test]
    fn builds_pdf_file_names() {
        assert_eq!(pdf_file_name("Quote Q-12"), "Quote Q-12.pdf");
        assert_eq!(pdf_file_name("invoice.PDF"), "invoice.PDF");
        assert_eq!(pdf_file_name("  "), "document.pdf");
    }
}
