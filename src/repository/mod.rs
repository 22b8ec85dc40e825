//! Tenant-scoped persistence for tenants, templates, documents and audit rows.
//!
//! Every template and document operation takes the owning tenant id and never
//! touches rows of another tenant. Document status changes go through the
//! `mark_*` methods, which only succeed from a legal predecessor state.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Document, DocumentFilter, DocumentStatus, GeneratedFile, NewAuditLog, NewDocument,
    NewTemplate, NewTenant, NewUser, Template, TemplateChanges, Tenant, TokenUpdate, User,
};

mod postgres;

pub use postgres::PgRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("document is {from}; cannot move to {to}")]
    InvalidTransition { from: String, to: DocumentStatus },
    #[error("database error: {0}")]
    Database(diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("database task failed: {0}")]
    Task(String),
}

impl From<diesel::result::Error> for RepositoryError {
    fn from(value: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};
        match value {
            Error::NotFound => RepositoryError::NotFound,
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info)
            | Error::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                RepositoryError::Conflict(info.message().to_string())
            }
            other => RepositoryError::Database(other),
        }
    }
}

pub type RepoResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait Repository: Send + Sync + 'static {
    async fn create_tenant(&self, tenant: NewTenant) -> RepoResult<Tenant>;
    async fn get_tenant(&self, id: Uuid) -> RepoResult<Option<Tenant>>;
    async fn update_tenant_tokens(&self, id: Uuid, update: TokenUpdate) -> RepoResult<()>;
    async fn create_user(&self, user: NewUser) -> RepoResult<User>;
    async fn get_user(&self, id: Uuid) -> RepoResult<Option<User>>;

    async fn list_templates(&self, tenant_id: Uuid) -> RepoResult<Vec<Template>>;
    async fn get_template(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Option<Template>>;
    /// Fails with `Conflict` when the name is already used within the tenant.
    async fn create_template(&self, template: NewTemplate) -> RepoResult<Template>;
    async fn update_template(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        changes: TemplateChanges,
    ) -> RepoResult<Template>;
    /// Fails with `Conflict` while any document references the template.
    async fn delete_template(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<()>;
    async fn count_template_documents(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<i64>;

    async fn create_document(&self, document: NewDocument) -> RepoResult<Document>;
    async fn get_document(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Option<Document>>;
    async fn list_documents(
        &self,
        tenant_id: Uuid,
        filter: &DocumentFilter,
    ) -> RepoResult<Vec<Document>>;
    async fn delete_document(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<bool>;
    async fn mark_processing(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        started_at: NaiveDateTime,
    ) -> RepoResult<Document>;
    async fn mark_completed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        file: GeneratedFile,
    ) -> RepoResult<Document>;
    async fn mark_failed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        error: &str,
        failed_at: NaiveDateTime,
    ) -> RepoResult<Document>;
    async fn mark_uploaded(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        crm_file_id: &str,
    ) -> RepoResult<Document>;
    /// Stores the id of a file already uploaded to the CRM while the document
    /// is still `COMPLETED`, so a retried upload can skip straight to attaching.
    async fn record_crm_file(&self, tenant_id: Uuid, id: Uuid, crm_file_id: &str)
        -> RepoResult<()>;
    /// Annotates the document with an error without changing its status.
    async fn record_error(&self, tenant_id: Uuid, id: Uuid, error: &str) -> RepoResult<()>;
    async fn failed_documents_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<Vec<Document>>;
    /// `PROCESSING` rows started before the cutoff and `PENDING` rows created before it.
    async fn stale_documents_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<Vec<Document>>;

    async fn append_audit(&self, entry: NewAuditLog) -> RepoResult<()>;
    async fn count_audit_logs_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<u64>;
    async fn delete_audit_logs_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<u64>;
}
