use axum::extract::{Json, Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::timestamp;
use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::jobs::{
    enqueue_generation, get_document_job_status, get_upload_job_status, GenerationPayload,
};
use crate::models::{
    CrmObjectRef, CrmObjectType, Document, DocumentFilter, DocumentStatus, NewAuditLog,
    NewDocument, Template,
};
use crate::queue::{JobHandle, JobStatus};
use crate::state::AppState;
use crate::variables::{map_from_json, validate_required};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

/// ASCII fallback in `filename`, the exact name in `filename*`.
fn attachment_content_disposition(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if !ch.is_ascii() || ch.is_ascii_control() => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(filename, percent_encoding::NON_ALPHANUMERIC);
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitized, encoded
    )
}

#[derive(Deserialize)]
pub struct CreateDocumentRequest {
    pub template_id: Uuid,
    pub name: Option<String>,
    #[serde(default)]
    pub variables: Value,
    pub crm_object_id: Option<String>,
    pub crm_object_type: Option<String>,
}

#[derive(Deserialize)]
pub struct DocumentListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub template_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: String,
    pub variables: Value,
    pub crm_object: Option<CrmObjectRef>,
    pub file_url: Option<String>,
    pub file_size: Option<i64>,
    pub crm_file_id: Option<String>,
    pub error_message: Option<String>,
    pub processing_started_at: Option<String>,
    pub processing_completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Document> for DocumentResponse {
    fn from(document: Document) -> Self {
        let crm_object = document.crm_object();
        Self {
            id: document.id,
            template_id: document.template_id,
            user_id: document.user_id,
            name: document.name,
            status: document.status,
            variables: document.variables,
            crm_object,
            file_url: document.file_url,
            file_size: document.file_size,
            crm_file_id: document.crm_file_id,
            error_message: document.error_message,
            processing_started_at: document.processing_started_at.map(timestamp),
            processing_completed_at: document.processing_completed_at.map(timestamp),
            created_at: timestamp(document.created_at),
            updated_at: timestamp(document.updated_at),
        }
    }
}

#[derive(Serialize)]
pub struct SubmittedDocumentResponse {
    pub document: DocumentResponse,
    pub job: JobHandle,
}

#[derive(Serialize)]
pub struct DocumentStatusResponse {
    pub document_id: Uuid,
    pub status: String,
    pub error_message: Option<String>,
    pub file_url: Option<String>,
    pub crm_file_id: Option<String>,
    /// Absent when no job was found or the queue is unreachable.
    pub job: Option<JobStatus>,
    pub upload_job: Option<JobStatus>,
}

/// `{id, type}` must be supplied together; the type is validated here so the
/// worker never sees a malformed reference.
fn crm_reference(
    object_id: Option<String>,
    object_type: Option<String>,
) -> AppResult<Option<CrmObjectRef>> {
    match (object_id, object_type) {
        (None, None) => Ok(None),
        (Some(object_id), Some(object_type)) => {
            let object_id = object_id.trim().to_string();
            if object_id.is_empty() {
                return Err(AppError::bad_request("crm_object_id must not be empty"));
            }
            let object_type: CrmObjectType =
                object_type.parse().map_err(AppError::bad_request)?;
            Ok(Some(CrmObjectRef {
                object_id,
                object_type,
            }))
        }
        _ => Err(AppError::bad_request(
            "crm_object_id and crm_object_type must be provided together",
        )),
    }
}

async fn load_document(state: &AppState, tenant_id: Uuid, id: Uuid) -> AppResult<Document> {
    state
        .repo
        .get_document(tenant_id, id)
        .await?
        .ok_or_else(AppError::not_found)
}

/// Inserts a `PENDING` document and queues its generation. A document whose
/// job could not be queued is removed again so no orphan stays behind.
async fn submit_document(
    state: &AppState,
    user: &AuthenticatedUser,
    template: &Template,
    document: NewDocument,
    audit_action: &str,
    audit_old: Option<Value>,
) -> AppResult<SubmittedDocumentResponse> {
    if !state.queue.is_ready() {
        return Err(AppError::service_unavailable(
            "document generation is temporarily unavailable; please retry shortly",
        ));
    }

    let document = state.repo.create_document(document).await?;
    let payload = GenerationPayload {
        document_id: document.id,
        template_id: template.id,
        tenant_id: user.tenant_id,
        user_id: user.user_id,
        variables: document.variables.clone(),
    };

    let job = match enqueue_generation(&state.queue, &payload).await {
        Ok(job) => job,
        Err(err) => {
            warn!(document_id = %document.id, error = %err, "failed to queue generation; removing document");
            if let Err(delete_err) = state
                .repo
                .delete_document(user.tenant_id, document.id)
                .await
            {
                error!(document_id = %document.id, error = %delete_err, "failed to remove unqueued document");
            }
            return Err(AppError::service_unavailable(
                "document generation is temporarily unavailable; please retry shortly",
            ));
        }
    };

    let mut entry = NewAuditLog::document(audit_action, &document).with_new(json!({
        "template_id": template.id,
        "status": DocumentStatus::Pending,
        "job_id": job.job_id,
    }));
    if let Some(old) = audit_old {
        entry = entry.with_old(old);
    }
    if let Err(err) = state.repo.append_audit(entry).await {
        warn!(document_id = %document.id, error = %err, "failed to write audit entry");
    }
    info!(
        document_id = %document.id,
        tenant_id = %document.tenant_id,
        job_id = %job.job_id,
        "document generation queued"
    );

    Ok(SubmittedDocumentResponse {
        document: document.into(),
        job,
    })
}

pub async fn create_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateDocumentRequest>,
) -> AppResult<(StatusCode, Json<SubmittedDocumentResponse>)> {
    let template = state
        .repo
        .get_template(user.tenant_id, payload.template_id)
        .await?
        .ok_or_else(AppError::not_found)?;
    if !template.is_active {
        return Err(AppError::bad_request("template is not active"));
    }

    let variables = match payload.variables {
        Value::Null => json!({}),
        value @ Value::Object(_) => value,
        _ => return Err(AppError::bad_request("variables must be a JSON object")),
    };
    let declarations = template
        .declarations()
        .map_err(|err| AppError::internal(format!("stored declarations are malformed: {err}")))?;
    validate_required(&declarations, &map_from_json(&variables)).into_result()?;

    let crm_object = crm_reference(payload.crm_object_id, payload.crm_object_type)?;
    let name = payload
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| template.name.clone());

    let document = NewDocument {
        id: Uuid::new_v4(),
        tenant_id: user.tenant_id,
        user_id: user.user_id,
        template_id: template.id,
        name,
        variables,
        crm_object_id: crm_object.as_ref().map(|object| object.object_id.clone()),
        crm_object_type: crm_object
            .as_ref()
            .map(|object| object.object_type.as_str().to_string()),
        status: DocumentStatus::Pending.as_str().to_string(),
    };

    let submitted =
        submit_document(&state, &user, &template, document, "document.created", None).await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}

pub async fn list_documents(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<DocumentListQuery>,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DocumentStatus>)
        .transpose()
        .map_err(AppError::bad_request)?;
    let filter = DocumentFilter {
        status,
        limit: query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        offset: query.offset.unwrap_or(0).max(0),
    };

    let documents = state.repo.list_documents(user.tenant_id, &filter).await?;
    Ok(Json(documents.into_iter().map(Into::into).collect()))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DocumentResponse>> {
    let document = load_document(&state, user.tenant_id, document_id).await?;
    Ok(Json(document.into()))
}

pub async fn document_status(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DocumentStatusResponse>> {
    let document = load_document(&state, user.tenant_id, document_id).await?;

    let job = match get_document_job_status(&state.queue, document.id).await {
        Ok(job) => job,
        Err(err) => {
            warn!(document_id = %document.id, error = %err, "generation job status unavailable");
            None
        }
    };
    let upload_job = if document.crm_object().is_some() {
        get_upload_job_status(&state.queue, document.id)
            .await
            .unwrap_or_else(|err| {
                warn!(document_id = %document.id, error = %err, "upload job status unavailable");
                None
            })
    } else {
        None
    };

    Ok(Json(DocumentStatusResponse {
        document_id: document.id,
        status: document.status,
        error_message: document.error_message,
        file_url: document.file_url,
        crm_file_id: document.crm_file_id,
        job,
        upload_job,
    }))
}

pub async fn download_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Response> {
    let document = load_document(&state, user.tenant_id, document_id).await?;
    let ready = matches!(
        document.status(),
        Some(DocumentStatus::Completed | DocumentStatus::Uploaded)
    );
    let path = match (ready, document.file_path.as_deref()) {
        (true, Some(path)) => path,
        _ => {
            return Err(AppError::conflict(format!(
                "document is {}; no file is available yet",
                document.status
            )))
        }
    };

    let bytes = state.files.read(path).await?;
    let disposition = HeaderValue::from_str(&attachment_content_disposition(
        &crate::workers::pdf_file_name(&document.name),
    ))
    .map_err(AppError::internal)?;

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// Retries a failed document as a brand-new `PENDING` document; the failed
/// row stays as it is.
pub async fn regenerate_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<(StatusCode, Json<SubmittedDocumentResponse>)> {
    let original = load_document(&state, user.tenant_id, document_id).await?;
    if original.status() != Some(DocumentStatus::Failed) {
        return Err(AppError::conflict(format!(
            "only FAILED documents can be regenerated; document is {}",
            original.status
        )));
    }
    let template = state
        .repo
        .get_template(user.tenant_id, original.template_id)
        .await?
        .ok_or_else(|| AppError::conflict("the document's template no longer exists"))?;

    let document = NewDocument {
        id: Uuid::new_v4(),
        tenant_id: user.tenant_id,
        user_id: user.user_id,
        template_id: template.id,
        name: original.name.clone(),
        variables: original.variables.clone(),
        crm_object_id: original.crm_object_id.clone(),
        crm_object_type: original.crm_object_type.clone(),
        status: DocumentStatus::Pending.as_str().to_string(),
    };

    let submitted = submit_document(
        &state,
        &user,
        &template,
        document,
        "document.regenerated",
        Some(json!({ "source_document_id": original.id })),
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}
