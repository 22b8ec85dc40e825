use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{
    jobs::{enqueue_upload, GenerationPayload, UploadPayload, JOB_GENERATE_DOCUMENT},
    models::{Document, DocumentStatus, GeneratedFile, NewAuditLog},
    queue::{FailureHandler, JobContext, JobExecution, JobHandler, JobRecord},
    render::RenderOptions,
    state::AppState,
    storage::SaveRequest,
    variables::{map_from_json, map_to_json, resolve_template, CrmContext},
};

use super::{audit, fail_document, pdf_file_name, PipelineError};

/// Renders a document: variables resolved, HTML converted to PDF, bytes
/// stored, document completed and the CRM upload queued when the document
/// points at a CRM record.
pub struct GenerateDocumentJob {
    state: AppState,
}

impl GenerateDocumentJob {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    async fn generate(
        &self,
        ctx: &JobContext,
        payload: &GenerationPayload,
        document: &Document,
    ) -> Result<Value, PipelineError> {
        let repo = self.state.repo.as_ref();
        let started = Utc::now();

        repo.mark_processing(document.tenant_id, document.id, started.naive_utc())
            .await?;
        ctx.progress(10).await;

        let template = repo
            .get_template(document.tenant_id, document.template_id)
            .await?
            .ok_or_else(|| {
                PipelineError::not_found(format!("template {} not found", document.template_id))
            })?;
        if payload.template_id != template.id {
            warn!(
                document_id = %document.id,
                job_template = %payload.template_id,
                document_template = %template.id,
                "job template differs from document; using the document's"
            );
        }
        let declarations = template.declarations().map_err(|err| {
            PipelineError::validation(format!("template variable declarations are malformed: {err}"))
        })?;

        let mut supplied = document.variable_values();
        supplied.extend(map_from_json(&payload.variables));
        let context = document.crm_object().map(|object| CrmContext {
            tenant_id: document.tenant_id,
            object,
        });

        let resolved = resolve_template(
            &template.content,
            &declarations,
            &supplied,
            context.as_ref(),
            self.state.crm.as_ref(),
            started,
        )
        .await?;
        ctx.progress(40).await;

        let pdf = self
            .state
            .renderer
            .render(&resolved.html, &RenderOptions::default())
            .await?;
        ctx.progress(70).await;

        let stored = self
            .state
            .files
            .save(SaveRequest {
                tenant_id: document.tenant_id,
                document_id: document.id,
                file_name: pdf_file_name(&document.name),
                bytes: pdf,
            })
            .await?;

        let completed = repo
            .mark_completed(
                document.tenant_id,
                document.id,
                GeneratedFile {
                    variables: map_to_json(&resolved.variables),
                    file_path: stored.path.clone(),
                    file_url: stored.url.clone(),
                    file_size: i64::try_from(stored.size).unwrap_or(i64::MAX),
                    completed_at: Utc::now().naive_utc(),
                },
            )
            .await?;
        ctx.progress(90).await;
        info!(
            document_id = %completed.id,
            tenant_id = %completed.tenant_id,
            path = %stored.path,
            size = stored.size,
            "document generated"
        );

        audit(
            repo,
            NewAuditLog::document("document.generated", &completed).with_new(json!({
                "status": DocumentStatus::Completed,
                "file_path": stored.path,
                "file_size": stored.size,
            })),
        )
        .await;

        let upload_queued = match completed.crm_object() {
            Some(_) => self.queue_upload(&completed).await,
            None => false,
        };
        ctx.progress(100).await;

        Ok(json!({
            "document_id": completed.id,
            "file_path": stored.path,
            "file_url": stored.url,
            "file_size": stored.size,
            "upload_queued": upload_queued,
        }))
    }

    /// The rendered file stays valid when queueing the upload fails, so the
    /// failure is annotated on the document instead of failing the job.
    async fn queue_upload(&self, document: &Document) -> bool {
        let payload = UploadPayload {
            document_id: document.id,
            tenant_id: document.tenant_id,
            user_id: document.user_id,
        };
        match enqueue_upload(&self.state.queue, &payload).await {
            Ok(handle) => {
                info!(document_id = %document.id, job_id = %handle.job_id, "CRM upload queued");
                true
            }
            Err(err) => {
                warn!(document_id = %document.id, error = %err, "failed to queue CRM upload");
                let message = format!("CRM upload could not be queued: {err}");
                if let Err(err) = self
                    .state
                    .repo
                    .record_error(document.tenant_id, document.id, &message)
                    .await
                {
                    warn!(document_id = %document.id, error = %err, "failed to annotate document");
                }
                false
            }
        }
    }

    async fn fail_attempt(
        &self,
        ctx: &JobContext,
        document: &Document,
        err: PipelineError,
    ) -> JobExecution {
        let repo = self.state.repo.as_ref();

        if !err.is_terminal() && !ctx.is_final_attempt() {
            warn!(
                document_id = %document.id,
                attempt = ctx.attempt(),
                error = %err,
                "document generation attempt failed"
            );
            if let Err(record_err) = repo
                .record_error(document.tenant_id, document.id, &err.message)
                .await
            {
                warn!(document_id = %document.id, error = %record_err, "failed to record attempt error");
            }
            return err.into_execution();
        }

        error!(
            document_id = %document.id,
            tenant_id = %document.tenant_id,
            attempt = ctx.attempt(),
            error = %err,
            "document generation failed"
        );
        // the document row may have moved since it was loaded
        let current = match repo.get_document(document.tenant_id, document.id).await {
            Ok(Some(current)) => current,
            _ => document.clone(),
        };
        match fail_document(repo, &current, &err.message).await {
            Ok(Some(failed)) => {
                audit(
                    repo,
                    NewAuditLog::document("document.generation_failed", &failed)
                        .with_old(json!({ "status": current.status }))
                        .with_new(json!({
                            "status": DocumentStatus::Failed,
                            "error": err.message,
                            "attempt": ctx.attempt(),
                        })),
                )
                .await;
            }
            Ok(None) => {}
            Err(mark_err) => {
                warn!(document_id = %document.id, error = %mark_err, "failed to mark document failed")
            }
        }
        JobExecution::failed(err.message)
    }
}

#[async_trait]
impl JobHandler for GenerateDocumentJob {
    fn job_type(&self) -> &'static str {
        JOB_GENERATE_DOCUMENT
    }

    async fn handle(&self, ctx: JobContext) -> JobExecution {
        let payload: GenerationPayload = match ctx.payload() {
            Ok(payload) => payload,
            Err(err) => return JobExecution::failed(format!("invalid generation payload: {err}")),
        };

        let document = match self
            .state
            .repo
            .get_document(payload.tenant_id, payload.document_id)
            .await
        {
            Ok(Some(document)) => document,
            Ok(None) => {
                return JobExecution::failed(format!(
                    "document {} not found for tenant {}",
                    payload.document_id, payload.tenant_id
                ))
            }
            Err(err) => return PipelineError::from(err).into_execution(),
        };

        match document.status() {
            Some(DocumentStatus::Completed | DocumentStatus::Uploaded) => {
                info!(document_id = %document.id, status = %document.status, "document already generated; skipping");
                return JobExecution::Success(Some(json!({
                    "document_id": document.id,
                    "skipped": true,
                })));
            }
            Some(DocumentStatus::Failed) => {
                return JobExecution::failed(format!(
                    "document {} already failed; submit a new generation request",
                    document.id
                ))
            }
            Some(DocumentStatus::Pending | DocumentStatus::Processing) => {}
            None => {
                return JobExecution::failed(format!(
                    "document {} has unknown status {}",
                    document.id, document.status
                ))
            }
        }

        match self.generate(&ctx, &payload, &document).await {
            Ok(result) => JobExecution::Success(Some(result)),
            Err(err) => self.fail_attempt(&ctx, &document, err).await,
        }
    }
}

/// Flips a document to `FAILED` when its generation job is failed for good
/// without the handler having done so, e.g. after a timeout or a stall.
pub struct GenerationFailureHandler {
    state: AppState,
}

impl GenerationFailureHandler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl FailureHandler for GenerationFailureHandler {
    async fn on_failed(&self, job: &JobRecord, error: &str) {
        let Ok(payload) = serde_json::from_value::<GenerationPayload>(job.payload.clone()) else {
            return;
        };
        let repo = self.state.repo.as_ref();
        let document = match repo
            .get_document(payload.tenant_id, payload.document_id)
            .await
        {
            Ok(Some(document)) => document,
            Ok(None) => return,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "failed to load document for failed job");
                return;
            }
        };

        let message = if error.is_empty() {
            "document generation failed"
        } else {
            error
        };
        match fail_document(repo, &document, message).await {
            Ok(Some(failed)) => {
                warn!(document_id = %failed.id, job_id = %job.id, "document marked failed after job failure");
                audit(
                    repo,
                    NewAuditLog::document("document.generation_failed", &failed).with_new(json!({
                        "status": DocumentStatus::Failed,
                        "error": message,
                        "attempt": job.attempts,
                    })),
                )
                .await;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(document_id = %document.id, error = %err, "failed to mark document failed")
            }
        }
    }
}
