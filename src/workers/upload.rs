use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    crm::UploadOptions,
    jobs::{UploadPayload, JOB_UPLOAD_TO_CRM},
    models::{Document, DocumentStatus, NewAuditLog},
    queue::{JobContext, JobExecution, JobHandler},
    state::AppState,
};

use super::{audit, PipelineError};

/// Pushes a completed document's PDF to the CRM and attaches it to the
/// document's CRM record. A failed upload leaves the document `COMPLETED`.
pub struct UploadToCrmJob {
    state: AppState,
}

/// `/docforge/{tenant}/{year}`
pub fn crm_folder_path(document: &Document) -> String {
    format!("/docforge/{}/{}", document.tenant_id, Utc::now().year())
}

impl UploadToCrmJob {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    async fn upload(&self, ctx: &JobContext, document: &Document) -> Result<Value, PipelineError> {
        let object = document.crm_object().ok_or_else(|| {
            PipelineError::validation(format!("document {} has no CRM object reference", document.id))
        })?;
        let path = document.file_path.as_deref().ok_or_else(|| {
            PipelineError::validation(format!("document {} has no generated file", document.id))
        })?;

        let (crm_file_id, crm_file_url) = match document.crm_file_id.clone() {
            Some(file_id) => {
                info!(
                    document_id = %document.id,
                    crm_file_id = %file_id,
                    "reusing CRM file from an earlier attempt"
                );
                (file_id, None)
            }
            None => {
                let bytes = self.state.files.read(path).await?;
                ctx.progress(20).await;

                let file_name = path.rsplit('/').next().unwrap_or(path);
                let uploaded = self
                    .state
                    .crm
                    .upload_file(
                        document.tenant_id,
                        file_name,
                        bytes,
                        &UploadOptions {
                            folder_path: crm_folder_path(document),
                        },
                    )
                    .await?;
                self.state
                    .repo
                    .record_crm_file(document.tenant_id, document.id, &uploaded.id)
                    .await?;
                (uploaded.id, uploaded.url)
            }
        };
        ctx.progress(60).await;

        self.state
            .crm
            .attach_file(
                document.tenant_id,
                &crm_file_id,
                object.object_type,
                &object.object_id,
            )
            .await?;
        ctx.progress(80).await;

        let updated = self
            .state
            .repo
            .mark_uploaded(document.tenant_id, document.id, &crm_file_id)
            .await?;
        info!(
            document_id = %updated.id,
            crm_file_id = %crm_file_id,
            object_type = %object.object_type,
            object_id = %object.object_id,
            "document uploaded to CRM"
        );

        audit(
            self.state.repo.as_ref(),
            NewAuditLog::document("document.uploaded", &updated)
                .with_old(json!({ "status": DocumentStatus::Completed }))
                .with_new(json!({
                    "status": DocumentStatus::Uploaded,
                    "crm_file_id": crm_file_id,
                    "object_type": object.object_type,
                    "object_id": object.object_id,
                })),
        )
        .await;
        ctx.progress(100).await;

        Ok(json!({
            "document_id": updated.id,
            "crm_file_id": crm_file_id,
            "crm_file_url": crm_file_url,
        }))
    }
}

#[async_trait]
impl JobHandler for UploadToCrmJob {
    fn job_type(&self) -> &'static str {
        JOB_UPLOAD_TO_CRM
    }

    async fn handle(&self, ctx: JobContext) -> JobExecution {
        let payload: UploadPayload = match ctx.payload() {
            Ok(payload) => payload,
            Err(err) => return JobExecution::failed(format!("invalid upload payload: {err}")),
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
            Some(DocumentStatus::Uploaded) => {
                info!(document_id = %document.id, "document already uploaded; skipping");
                return JobExecution::Success(Some(json!({
                    "document_id": document.id,
                    "crm_file_id": document.crm_file_id,
                    "skipped": true,
                })));
            }
            Some(DocumentStatus::Completed) => {}
            _ => {
                return JobExecution::failed(format!(
                    "document {} is {}; only COMPLETED documents can be uploaded",
                    document.id, document.status
                ))
            }
        }

        match self.upload(&ctx, &document).await {
            Ok(result) => JobExecution::Success(Some(result)),
            Err(err) => {
                warn!(
                    document_id = %document.id,
                    attempt = ctx.attempt(),
                    error = %err,
                    "CRM upload failed"
                );
                let repo = self.state.repo.as_ref();
                audit(
                    repo,
                    NewAuditLog::document("document.upload_failed", &document).with_new(json!({
                        "error": err.message,
                        "attempt": ctx.attempt(),
                    })),
                )
                .await;
                let annotation = format!("CRM upload failed: {}", err.message);
                if let Err(record_err) = repo
                    .record_error(document.tenant_id, document.id, &annotation)
                    .await
                {
                    warn!(document_id = %document.id, error = %record_err, "failed to annotate document");
                }
                err.into_execution()
            }
        }
    }
}
