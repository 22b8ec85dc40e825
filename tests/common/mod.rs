#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use chrono::{NaiveDateTime, Utc};
use diesel::connection::SimpleConnection;
use docforge::auth::jwt::JwtService;
use docforge::config::{AppConfig, QueueBackend, StorageBackend};
use docforge::db::{self, PgPool};
use docforge::crm::{
    ContactSearch, CrmApi, CrmError, CrmObject, PropertyDescriptor, SearchResults, UploadOptions,
    UploadedFile,
};
use docforge::models::{
    AuditLog, CrmObjectType, Document, DocumentFilter, DocumentStatus, GeneratedFile,
    NewAuditLog, NewDocument, NewTemplate, NewTenant, NewUser, Template, TemplateChanges, Tenant,
    TokenUpdate, User,
};
use docforge::jobs::{get_document_job_status, get_upload_job_status};
use docforge::queue::{JobState, JobStatus, MemoryBroker, QueueManager, QueueSettings};
use docforge::render::{PdfRenderer, RenderError, RenderOptions};
use docforge::repository::{RepoResult, Repository, RepositoryError};
use docforge::routes;
use docforge::state::AppState;
use docforge::storage::{FileStore, LocalFileStore};
use docforge::variables::{VariableMap, VariableValue};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;
use uuid::Uuid;

pub const FAKE_PDF: &[u8] = b"%PDF-1.4\n% docforge test\n%%EOF";

static DB_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

#[derive(Default)]
struct Tables {
    tenants: HashMap<Uuid, Tenant>,
    users: HashMap<Uuid, User>,
    templates: HashMap<Uuid, Template>,
    documents: HashMap<Uuid, Document>,
    audit: Vec<AuditLog>,
}

/// In-memory repository with the same tenant scoping and status-edge checks
/// as the Postgres one.
#[derive(Default)]
pub struct FakeRepository {
    tables: Mutex<Tables>,
}

impl FakeRepository {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap()
    }

    pub fn audit_actions(&self) -> Vec<String> {
        self.lock().audit.iter().map(|row| row.action.clone()).collect()
    }

    pub fn audit_count(&self) -> usize {
        self.lock().audit.len()
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    /// Moves every timestamp of the document `hours` into the past.
    pub fn backdate_document(&self, id: Uuid, hours: i64) {
        let shift = chrono::Duration::hours(hours);
        if let Some(document) = self.lock().documents.get_mut(&id) {
            document.created_at -= shift;
            document.updated_at -= shift;
            document.processing_started_at = document.processing_started_at.map(|at| at - shift);
        }
    }

    /// Points the document at a stored file without changing its status.
    pub fn attach_file(&self, id: Uuid, path: &str, size: i64) {
        if let Some(document) = self.lock().documents.get_mut(&id) {
            document.file_path = Some(path.to_string());
            document.file_size = Some(size);
        }
    }

    pub fn backdate_audit(&self, hours: i64) {
        let shift = chrono::Duration::hours(hours);
        for row in self.lock().audit.iter_mut() {
            row.created_at -= shift;
        }
    }

    fn transition<F>(&self, tenant_id: Uuid, id: Uuid, to: DocumentStatus, apply: F) -> RepoResult<Document>
    where
        F: FnOnce(&mut Document),
    {
        let mut tables = self.lock();
        let document = tables
            .documents
            .get_mut(&id)
            .filter(|document| document.tenant_id == tenant_id)
            .ok_or(RepositoryError::NotFound)?;
        let allowed = document
            .status()
            .is_some_and(|current| current.can_transition_to(to));
        if !allowed {
            return Err(RepositoryError::InvalidTransition {
                from: document.status.clone(),
                to,
            });
        }
        document.status = to.as_str().to_string();
        document.updated_at = now();
        apply(document);
        Ok(document.clone())
    }
}

#[async_trait]
impl Repository for FakeRepository {
    async fn create_tenant(&self, tenant: NewTenant) -> RepoResult<Tenant> {
        let row = Tenant {
            id: tenant.id,
            name: tenant.name,
            portal_id: tenant.portal_id,
            access_token: tenant.access_token,
            refresh_token: tenant.refresh_token,
            token_expires_at: tenant.token_expires_at,
            is_active: true,
            created_at: now(),
            updated_at: now(),
        };
        self.lock().tenants.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_tenant(&self, id: Uuid) -> RepoResult<Option<Tenant>> {
        Ok(self.lock().tenants.get(&id).cloned())
    }

    async fn update_tenant_tokens(&self, id: Uuid, update: TokenUpdate) -> RepoResult<()> {
        let mut tables = self.lock();
        let tenant = tables.tenants.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        tenant.access_token = Some(update.access_token);
        tenant.refresh_token = Some(update.refresh_token);
        tenant.token_expires_at = Some(update.expires_at);
        Ok(())
    }

    async fn create_user(&self, user: NewUser) -> RepoResult<User> {
        let row = User {
            id: user.id,
            tenant_id: user.tenant_id,
            email: user.email,
            name: user.name,
            role: user.role,
            created_at: now(),
            updated_at: now(),
        };
        self.lock().users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_user(&self, id: Uuid) -> RepoResult<Option<User>> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn list_templates(&self, tenant_id: Uuid) -> RepoResult<Vec<Template>> {
        let mut templates: Vec<_> = self
            .lock()
            .templates
            .values()
            .filter(|template| template.tenant_id == tenant_id)
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn get_template(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Option<Template>> {
        Ok(self
            .lock()
            .templates
            .get(&id)
            .filter(|template| template.tenant_id == tenant_id)
            .cloned())
    }

    async fn create_template(&self, template: NewTemplate) -> RepoResult<Template> {
        let mut tables = self.lock();
        let taken = tables
            .templates
            .values()
            .any(|row| row.tenant_id == template.tenant_id && row.name == template.name);
        if taken {
            return Err(RepositoryError::Conflict(format!(
                "a template named {} already exists",
                template.name
            )));
        }
        let row = Template {
            id: template.id,
            tenant_id: template.tenant_id,
            created_by: template.created_by,
            name: template.name,
            description: template.description,
            content: template.content,
            variables: template.variables,
            is_active: template.is_active,
            created_at: now(),
            updated_at: now(),
        };
        tables.templates.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_template(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        changes: TemplateChanges,
    ) -> RepoResult<Template> {
        let mut tables = self.lock();
        let template = tables
            .templates
            .get_mut(&id)
            .filter(|template| template.tenant_id == tenant_id)
            .ok_or(RepositoryError::NotFound)?;
        if let Some(name) = changes.name {
            template.name = name;
        }
        if let Some(description) = changes.description {
            template.description = description;
        }
        if let Some(content) = changes.content {
            template.content = content;
        }
        if let Some(variables) = changes.variables {
            template.variables = variables;
        }
        if let Some(is_active) = changes.is_active {
            template.is_active = is_active;
        }
        template.updated_at = now();
        Ok(template.clone())
    }

    async fn delete_template(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<()> {
        let mut tables = self.lock();
        if tables.documents.values().any(|document| document.template_id == id) {
            return Err(RepositoryError::Conflict("template is in use".into()));
        }
        match tables.templates.get(&id) {
            Some(template) if template.tenant_id == tenant_id => {
                tables.templates.remove(&id);
                Ok(())
            }
            _ => Err(RepositoryError::NotFound),
        }
    }

    async fn count_template_documents(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<i64> {
        Ok(self
            .lock()
            .documents
            .values()
            .filter(|document| document.tenant_id == tenant_id && document.template_id == id)
            .count() as i64)
    }

    async fn create_document(&self, document: NewDocument) -> RepoResult<Document> {
        let row = Document {
            id: document.id,
            tenant_id: document.tenant_id,
            user_id: document.user_id,
            template_id: document.template_id,
            name: document.name,
            variables: document.variables,
            crm_object_id: document.crm_object_id,
            crm_object_type: document.crm_object_type,
            status: document.status,
            file_path: None,
            file_url: None,
            file_size: None,
            crm_file_id: None,
            error_message: None,
            processing_started_at: None,
            processing_completed_at: None,
            created_at: now(),
            updated_at: now(),
        };
        self.lock().documents.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_document(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Option<Document>> {
        Ok(self
            .lock()
            .documents
            .get(&id)
            .filter(|document| document.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_documents(
        &self,
        tenant_id: Uuid,
        filter: &DocumentFilter,
    ) -> RepoResult<Vec<Document>> {
        let mut documents: Vec<_> = self
            .lock()
            .documents
            .values()
            .filter(|document| document.tenant_id == tenant_id)
            .filter(|document| {
                filter
                    .status
                    .map_or(true, |status| document.status == status.as_str())
            })
            .cloned()
            .collect();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(documents
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn delete_document(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<bool> {
        let mut tables = self.lock();
        match tables.documents.get(&id) {
            Some(document) if document.tenant_id == tenant_id => {
                tables.documents.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_processing(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        started_at: NaiveDateTime,
    ) -> RepoResult<Document> {
        self.transition(tenant_id, id, DocumentStatus::Processing, |document| {
            document.processing_started_at = Some(started_at);
        })
    }

    async fn mark_completed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        file: GeneratedFile,
    ) -> RepoResult<Document> {
        self.transition(tenant_id, id, DocumentStatus::Completed, |document| {
            document.variables = file.variables;
            document.file_path = Some(file.file_path);
            document.file_url = Some(file.file_url);
            document.file_size = Some(file.file_size);
            document.error_message = None;
            document.processing_completed_at = Some(file.completed_at);
        })
    }

    async fn mark_failed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        error: &str,
        failed_at: NaiveDateTime,
    ) -> RepoResult<Document> {
        self.transition(tenant_id, id, DocumentStatus::Failed, |document| {
            document.error_message = Some(error.to_string());
            document.processing_completed_at = Some(failed_at);
        })
    }

    async fn mark_uploaded(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        crm_file_id: &str,
    ) -> RepoResult<Document> {
        self.transition(tenant_id, id, DocumentStatus::Uploaded, |document| {
            document.crm_file_id = Some(crm_file_id.to_string());
            document.error_message = None;
        })
    }

    async fn record_crm_file(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        crm_file_id: &str,
    ) -> RepoResult<()> {
        let mut tables = self.lock();
        let document = tables
            .documents
            .get_mut(&id)
            .filter(|document| document.tenant_id == tenant_id)
            .ok_or(RepositoryError::NotFound)?;
        if document.status != DocumentStatus::Completed.as_str() {
            return Err(RepositoryError::InvalidTransition {
                from: document.status.clone(),
                to: DocumentStatus::Uploaded,
            });
        }
        document.crm_file_id = Some(crm_file_id.to_string());
        document.updated_at = now();
        Ok(())
    }

    async fn record_error(&self, tenant_id: Uuid, id: Uuid, error: &str) -> RepoResult<()> {
        let mut tables = self.lock();
        let document = tables
            .documents
            .get_mut(&id)
            .filter(|document| document.tenant_id == tenant_id)
            .ok_or(RepositoryError::NotFound)?;
        document.error_message = Some(error.to_string());
        document.updated_at = now();
        Ok(())
    }

    async fn failed_documents_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<Vec<Document>> {
        Ok(self
            .lock()
            .documents
            .values()
            .filter(|document| document.status == DocumentStatus::Failed.as_str())
            .filter(|document| document.updated_at < cutoff)
            .filter(|document| tenant_id.map_or(true, |tenant| document.tenant_id == tenant))
            .cloned()
            .collect())
    }

    async fn stale_documents_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<Vec<Document>> {
        Ok(self
            .lock()
            .documents
            .values()
            .filter(|document| match document.status() {
                Some(DocumentStatus::Processing) => document
                    .processing_started_at
                    .is_some_and(|started| started < cutoff),
                Some(DocumentStatus::Pending) => document.created_at < cutoff,
                _ => false,
            })
            .filter(|document| tenant_id.map_or(true, |tenant| document.tenant_id == tenant))
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: NewAuditLog) -> RepoResult<()> {
        self.lock().audit.push(AuditLog {
            id: entry.id,
            tenant_id: entry.tenant_id,
            user_id: entry.user_id,
            action: entry.action,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            old_values: entry.old_values,
            new_values: entry.new_values,
            created_at: now(),
        });
        Ok(())
    }

    async fn count_audit_logs_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<u64> {
        Ok(self
            .lock()
            .audit
            .iter()
            .filter(|row| row.created_at < cutoff)
            .filter(|row| tenant_id.map_or(true, |tenant| row.tenant_id == Some(tenant)))
            .count() as u64)
    }

    async fn delete_audit_logs_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<u64> {
        let mut tables = self.lock();
        let before = tables.audit.len();
        tables.audit.retain(|row| {
            let scoped = tenant_id.map_or(true, |tenant| row.tenant_id == Some(tenant));
            !(scoped && row.created_at < cutoff)
        });
        Ok((before - tables.audit.len()) as u64)
    }
}

/// Renderer double: fails the next `fail_next` calls, or every call while
/// `always_fail` is set.
#[derive(Default)]
pub struct FakeRenderer {
    pub calls: AtomicUsize,
    pub fail_next: AtomicUsize,
    pub always_fail: AtomicBool,
    pub last_html: Mutex<Option<String>>,
}

impl FakeRenderer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_html(&self) -> Option<String> {
        self.last_html.lock().unwrap().clone()
    }
}

#[async_trait]
impl PdfRenderer for FakeRenderer {
    async fn health(&self) -> Result<(), RenderError> {
        Ok(())
    }

    async fn render(&self, html: &str, _options: &RenderOptions) -> Result<Vec<u8>, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_html.lock().unwrap() = Some(html.to_string());

        let scheduled_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if scheduled_failure || self.always_fail.load(Ordering::SeqCst) {
            return Err(RenderError::Status {
                status: 503,
                body: "renderer overloaded".into(),
            });
        }
        Ok(FAKE_PDF.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub file_name: String,
    pub folder_path: String,
    pub size: usize,
}

/// CRM double holding objects by `(type, id)`.
#[derive(Default)]
pub struct FakeCrm {
    objects: Mutex<HashMap<(CrmObjectType, String), VariableMap>>,
    pub uploads: Mutex<Vec<RecordedUpload>>,
    pub attachments: Mutex<Vec<(String, CrmObjectType, String)>>,
    pub fail_uploads: AtomicBool,
    /// Number of upcoming `attach_file` calls that fail with a 503.
    pub fail_attachments: AtomicUsize,
}

impl FakeCrm {
    pub fn insert_object(&self, object_type: CrmObjectType, id: &str, properties: &[(&str, &str)]) {
        let properties = properties
            .iter()
            .map(|(name, value)| (name.to_string(), VariableValue::Text(value.to_string())))
            .collect();
        self.objects
            .lock()
            .unwrap()
            .insert((object_type, id.to_string()), properties);
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl CrmApi for FakeCrm {
    async fn get_object(
        &self,
        _tenant_id: Uuid,
        object_type: CrmObjectType,
        object_id: &str,
        _properties: &[String],
    ) -> Result<CrmObject, CrmError> {
        let properties = self
            .objects
            .lock()
            .unwrap()
            .get(&(object_type, object_id.to_string()))
            .cloned()
            .ok_or(CrmError::NotFound)?;
        Ok(CrmObject {
            id: object_id.to_string(),
            properties,
            created_at: None,
            updated_at: None,
        })
    }

    async fn search_contacts(
        &self,
        _tenant_id: Uuid,
        search: &ContactSearch,
    ) -> Result<SearchResults, CrmError> {
        let objects = self.objects.lock().unwrap();
        let results: Vec<CrmObject> = objects
            .iter()
            .filter(|((object_type, _), _)| *object_type == CrmObjectType::Contact)
            .filter(|(_, properties)| match search.query.as_deref() {
                Some(query) => properties
                    .values()
                    .any(|value| value.display().contains(query)),
                None => true,
            })
            .take(search.limit as usize)
            .map(|((_, id), properties)| CrmObject {
                id: id.clone(),
                properties: properties.clone(),
                created_at: None,
                updated_at: None,
            })
            .collect();
        Ok(SearchResults {
            total: results.len() as u64,
            results,
            next_after: None,
        })
    }

    async fn upload_file(
        &self,
        _tenant_id: Uuid,
        file_name: &str,
        bytes: Vec<u8>,
        options: &UploadOptions,
    ) -> Result<UploadedFile, CrmError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(CrmError::Status {
                status: 500,
                body: "file service unavailable".into(),
            });
        }
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(RecordedUpload {
            file_name: file_name.to_string(),
            folder_path: options.folder_path.clone(),
            size: bytes.len(),
        });
        let id = format!("file-{}", uploads.len());
        Ok(UploadedFile {
            url: Some(format!("https://crm.test/files/{id}")),
            id,
        })
    }

    async fn attach_file(
        &self,
        _tenant_id: Uuid,
        file_id: &str,
        object_type: CrmObjectType,
        object_id: &str,
    ) -> Result<(), CrmError> {
        let scheduled_failure = self
            .fail_attachments
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if scheduled_failure {
            return Err(CrmError::Status {
                status: 503,
                body: "association service unavailable".into(),
            });
        }
        self.attachments.lock().unwrap().push((
            file_id.to_string(),
            object_type,
            object_id.to_string(),
        ));
        Ok(())
    }

    async fn get_properties(
        &self,
        _tenant_id: Uuid,
        object_type: CrmObjectType,
    ) -> Result<Vec<PropertyDescriptor>, CrmError> {
        let objects = self.objects.lock().unwrap();
        let mut names: Vec<String> = objects
            .iter()
            .filter(|((kind, _), _)| *kind == object_type)
            .flat_map(|(_, properties)| properties.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        Ok(names
            .into_iter()
            .map(|name| PropertyDescriptor {
                label: name.clone(),
                name,
                property_type: "string".into(),
                field_type: "text".into(),
                group_name: None,
                description: None,
            })
            .collect())
    }
}

pub fn test_config(storage_root: &str, max_attempts: u32) -> AppConfig {
    AppConfig {
        database_url: "postgres://unused@localhost/docforge_test".to_string(),
        database_max_pool_size: 1,
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        jwt_secret: "test-secret".to_string(),
        jwt_issuer: "test-issuer".to_string(),
        jwt_audience: "test-audience".to_string(),
        jwt_expiry_minutes: 60,
        cors_allowed_origin: None,
        public_base_url: "http://docforge.test".to_string(),
        storage_backend: StorageBackend::Local,
        storage_root: storage_root.to_string(),
        storage_temp_dir: format!("{storage_root}/tmp"),
        aws_endpoint_url: None,
        aws_access_key_id: None,
        aws_secret_access_key: None,
        aws_region: "us-east-1".to_string(),
        s3_bucket: None,
        render_url: "http://renderer.test".to_string(),
        render_timeout: Duration::from_secs(5),
        crm_api_base: "http://crm.test".to_string(),
        crm_client_id: String::new(),
        crm_client_secret: String::new(),
        crm_token_url: "http://crm.test/oauth/v1/token".to_string(),
        queue_backend: QueueBackend::Memory,
        queue_health_interval: Duration::from_secs(30),
        queue_reconnect_base: Duration::from_millis(10),
        queue_reconnect_max: Duration::from_millis(50),
        queue_reconnect_max_attempts: 3,
        queue_poll_interval: Duration::from_millis(10),
        job_max_attempts: max_attempts,
        job_backoff_base: Duration::from_millis(5),
        job_backoff_max: Duration::from_millis(20),
        job_timeout: Duration::from_secs(10),
        job_max_stalled_count: 1,
        generation_concurrency: 2,
        upload_concurrency: 1,
        cleanup_concurrency: 1,
        cleanup_schedule_enabled: false,
    }
}

pub struct TestAppBuilder {
    max_attempts: u32,
    queue_ready: bool,
    workers: bool,
}

impl TestAppBuilder {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Leaves the broker unconnected so the queue reports not ready.
    pub fn queue_down(mut self) -> Self {
        self.queue_ready = false;
        self
    }

    pub fn without_workers(mut self) -> Self {
        self.workers = false;
        self
    }

    pub async fn build(self) -> Result<TestApp> {
        let storage = TempDir::new()?;
        let root = storage
            .path()
            .to_str()
            .ok_or_else(|| anyhow!("temp dir is not utf-8"))?
            .to_string();
        let config = test_config(&root, self.max_attempts);

        let repo = Arc::new(FakeRepository::default());
        let renderer = Arc::new(FakeRenderer::default());
        let crm = Arc::new(FakeCrm::default());
        let broker = Arc::new(MemoryBroker::new());
        let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(
            &config.storage_root,
            &config.storage_temp_dir,
            &config.public_base_url,
        )?);

        let queue = QueueManager::new(broker.clone(), QueueSettings::from_config(&config));
        if self.queue_ready {
            queue.initialize().await?;
        }

        let jwt = JwtService::from_config(&config);
        let state = AppState::new(
            config,
            repo.clone(),
            files,
            queue,
            crm.clone(),
            renderer.clone(),
            jwt,
        );
        if self.workers {
            docforge::register_workers(&state);
        }

        let tenant = repo
            .create_tenant(NewTenant {
                id: Uuid::new_v4(),
                name: "Acme".into(),
                portal_id: "4242".into(),
                access_token: None,
                refresh_token: None,
                token_expires_at: None,
            })
            .await?;
        let user = repo
            .create_user(NewUser {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                email: "ops@acme.test".into(),
                name: Some("Ops".into()),
                role: "admin".into(),
            })
            .await?;
        let token = state.jwt.generate_token(&user)?;
        let router = routes::create_router(state.clone());

        Ok(TestApp {
            state,
            router,
            repo,
            renderer,
            crm,
            broker,
            tenant,
            user,
            token,
            _storage: storage,
        })
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    pub repo: Arc<FakeRepository>,
    pub renderer: Arc<FakeRenderer>,
    pub crm: Arc<FakeCrm>,
    pub broker: Arc<MemoryBroker>,
    pub tenant: Tenant,
    pub user: User,
    pub token: String,
    _storage: TempDir,
}

impl TestApp {
    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            max_attempts: 3,
            queue_ready: true,
            workers: true,
        }
    }

    pub async fn new() -> Result<Self> {
        Self::builder().build().await
    }

    pub async fn shutdown(&self) {
        self.state.queue.stop().await;
    }

    /// Token for a second user of the same tenant with the given role.
    pub async fn token_for_role(&self, role: &str) -> Result<String> {
        let user = self
            .repo
            .create_user(NewUser {
                id: Uuid::new_v4(),
                tenant_id: self.tenant.id,
                email: format!("{role}@acme.test"),
                name: None,
                role: role.to_string(),
            })
            .await?;
        self.state.jwt.generate_token(&user)
    }

    pub async fn insert_template(&self, name: &str, content: &str, variables: Value) -> Result<Template> {
        Ok(self
            .repo
            .create_template(NewTemplate {
                id: Uuid::new_v4(),
                tenant_id: self.tenant.id,
                created_by: Some(self.user.id),
                name: name.to_string(),
                description: None,
                content: content.to_string(),
                variables,
                is_active: true,
            })
            .await?)
    }

    /// Inserts a `PENDING` document without queueing it.
    pub async fn insert_document(
        &self,
        template: &Template,
        variables: Value,
        crm_object: Option<(CrmObjectType, &str)>,
    ) -> Result<Document> {
        Ok(self
            .repo
            .create_document(NewDocument {
                id: Uuid::new_v4(),
                tenant_id: self.tenant.id,
                user_id: self.user.id,
                template_id: template.id,
                name: format!("{} document", template.name),
                variables,
                crm_object_id: crm_object.map(|(_, id)| id.to_string()),
                crm_object_type: crm_object.map(|(kind, _)| kind.as_str().to_string()),
                status: DocumentStatus::Pending.as_str().to_string(),
            })
            .await?)
    }

    pub async fn document(&self, id: Uuid) -> Result<Document> {
        self.repo
            .get_document(self.tenant.id, id)
            .await?
            .ok_or_else(|| anyhow!("document {id} missing"))
    }

    /// Polls until the document satisfies `done`, failing after five seconds.
    pub async fn wait_for_document<F>(&self, id: Uuid, done: F) -> Result<Document>
    where
        F: Fn(&Document) -> bool,
    {
        let done = &done;
        eventually(move || async move {
            let document = self.document(id).await?;
            Ok(done(&document).then_some(document))
        })
        .await
    }

    pub async fn wait_for_status(&self, id: Uuid, status: DocumentStatus) -> Result<Document> {
        self.wait_for_document(id, |document| document.status == status.as_str())
            .await
    }

    pub async fn wait_for_generation_job(&self, id: Uuid, state: JobState) -> Result<JobStatus> {
        let queue = &self.state.queue;
        eventually(move || async move {
            let job = get_document_job_status(queue, id).await?;
            Ok(job.filter(|job| job.state == state))
        })
        .await
    }

    pub async fn wait_for_upload_job(&self, id: Uuid, state: JobState) -> Result<JobStatus> {
        let queue = &self.state.queue;
        eventually(move || async move {
            let job = get_upload_job_status(queue, id).await?;
            Ok(job.filter(|job| job.state == state))
        })
        .await
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(body.map(Body::from).unwrap_or_else(Body::empty))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        self.send(Method::GET, path, None, Some(&self.token)).await
    }

    pub async fn delete(&self, path: &str) -> Result<hyper::Response<Body>> {
        self.send(Method::DELETE, path, None, Some(&self.token)).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        self.send(Method::POST, path, Some(body), Some(&self.token))
            .await
    }

    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        self.send(Method::PATCH, path, Some(body), Some(&self.token))
            .await
    }
}

pub async fn eventually<F, Fut, T>(mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_json(response: hyper::Response<Body>) -> Result<Value> {
    let bytes = body_to_vec(response.into_body()).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

/// Pool on `TEST_DATABASE_URL` with migrations applied and every table
/// emptied. `None` when the variable is unset so the caller can skip.
pub async fn test_database() -> Result<Option<PgPool>> {
    let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping Postgres test");
        return Ok(None);
    };
    let pool = db::init_pool_with_size(&database_url, 4)?;
    let prepared = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        docforge::run_migrations(&prepared)?;
        let mut conn = prepared
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.batch_execute(
            "TRUNCATE TABLE jobs, queue_controls, audit_logs, documents, templates, users, tenants;",
        )
        .context("failed to truncate tables")?;
        Ok(())
    })
    .await
    .context("migration task panicked")??;
    Ok(Some(pool))
}
