use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use tokio::task;
use uuid::Uuid;

use super::{RepoResult, Repository, RepositoryError};
use crate::db::PgPool;
use crate::models::{
    Document, DocumentFilter, DocumentStatus, GeneratedFile, NewAuditLog, NewDocument,
    NewTemplate, NewTenant, NewUser, Template, TemplateChanges, Tenant, TokenUpdate, User,
};
use crate::schema::{audit_logs, documents, templates, tenants, users};

/// Diesel-backed repository; every call runs on the blocking pool.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run<T, F>(&self, f: F) -> RepoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> RepoResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| RepositoryError::Pool(err.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|err| RepositoryError::Task(err.to_string()))?
    }
}

fn status_strings(statuses: &[DocumentStatus]) -> Vec<&'static str> {
    statuses.iter().map(DocumentStatus::as_str).collect()
}

/// Resolves the outcome of a conditional status update: the refreshed row when
/// it matched, otherwise `NotFound` or `InvalidTransition` depending on whether
/// the document exists.
fn finish_transition(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    id: Uuid,
    updated: usize,
    to: DocumentStatus,
) -> RepoResult<Document> {
    let current = documents::table
        .filter(documents::tenant_id.eq(tenant_id))
        .filter(documents::id.eq(id))
        .first::<Document>(conn)
        .optional()?
        .ok_or(RepositoryError::NotFound)?;

    if updated == 0 {
        return Err(RepositoryError::InvalidTransition {
            from: current.status,
            to,
        });
    }
    Ok(current)
}

fn template_conflict(err: diesel::result::Error) -> RepositoryError {
    match RepositoryError::from(err) {
        RepositoryError::Conflict(_) => {
            RepositoryError::Conflict("a template with this name already exists".into())
        }
        other => other,
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn create_tenant(&self, tenant: NewTenant) -> RepoResult<Tenant> {
        self.run(move |conn| {
            Ok(diesel::insert_into(tenants::table)
                .values(&tenant)
                .get_result(conn)?)
        })
        .await
    }

    async fn get_tenant(&self, id: Uuid) -> RepoResult<Option<Tenant>> {
        self.run(move |conn| Ok(tenants::table.find(id).first(conn).optional()?))
            .await
    }

    async fn update_tenant_tokens(&self, id: Uuid, update: TokenUpdate) -> RepoResult<()> {
        self.run(move |conn| {
            let updated = diesel::update(tenants::table.find(id))
                .set((
                    tenants::access_token.eq(Some(update.access_token)),
                    tenants::refresh_token.eq(Some(update.refresh_token)),
                    tenants::token_expires_at.eq(Some(update.expires_at)),
                    tenants::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            if updated == 0 {
                return Err(RepositoryError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn create_user(&self, user: NewUser) -> RepoResult<User> {
        self.run(move |conn| {
            Ok(diesel::insert_into(users::table)
                .values(&user)
                .get_result(conn)?)
        })
        .await
    }

    async fn get_user(&self, id: Uuid) -> RepoResult<Option<User>> {
        self.run(move |conn| Ok(users::table.find(id).first(conn).optional()?))
            .await
    }

    async fn list_templates(&self, tenant_id: Uuid) -> RepoResult<Vec<Template>> {
        self.run(move |conn| {
            Ok(templates::table
                .filter(templates::tenant_id.eq(tenant_id))
                .order(templates::name.asc())
                .load(conn)?)
        })
        .await
    }

    async fn get_template(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Option<Template>> {
        self.run(move |conn| {
            Ok(templates::table
                .filter(templates::tenant_id.eq(tenant_id))
                .filter(templates::id.eq(id))
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn create_template(&self, template: NewTemplate) -> RepoResult<Template> {
        self.run(move |conn| {
            diesel::insert_into(templates::table)
                .values(&template)
                .get_result(conn)
                .map_err(template_conflict)
        })
        .await
    }

    async fn update_template(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        changes: TemplateChanges,
    ) -> RepoResult<Template> {
        self.run(move |conn| {
            let target = || {
                templates::table
                    .filter(templates::tenant_id.eq(tenant_id))
                    .filter(templates::id.eq(id))
            };

            if changes.is_empty() {
                return target()
                    .first(conn)
                    .optional()?
                    .ok_or(RepositoryError::NotFound);
            }

            diesel::update(target())
                .set((&changes, templates::updated_at.eq(Utc::now().naive_utc())))
                .get_result(conn)
                .optional()
                .map_err(template_conflict)?
                .ok_or(RepositoryError::NotFound)
        })
        .await
    }

    async fn delete_template(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<()> {
        self.run(move |conn| {
            conn.transaction(|conn| {
                let in_use: i64 = documents::table
                    .filter(documents::tenant_id.eq(tenant_id))
                    .filter(documents::template_id.eq(id))
                    .count()
                    .get_result(conn)?;
                if in_use > 0 {
                    return Err(RepositoryError::Conflict(format!(
                        "template is used by {in_use} document(s)"
                    )));
                }

                let deleted = diesel::delete(
                    templates::table
                        .filter(templates::tenant_id.eq(tenant_id))
                        .filter(templates::id.eq(id)),
                )
                .execute(conn)?;
                if deleted == 0 {
                    return Err(RepositoryError::NotFound);
                }
                Ok(())
            })
        })
        .await
    }

    async fn count_template_documents(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<i64> {
        self.run(move |conn| {
            Ok(documents::table
                .filter(documents::tenant_id.eq(tenant_id))
                .filter(documents::template_id.eq(id))
                .count()
                .get_result(conn)?)
        })
        .await
    }

    async fn create_document(&self, document: NewDocument) -> RepoResult<Document> {
        self.run(move |conn| {
            Ok(diesel::insert_into(documents::table)
                .values(&document)
                .get_result(conn)?)
        })
        .await
    }

    async fn get_document(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Option<Document>> {
        self.run(move |conn| {
            Ok(documents::table
                .filter(documents::tenant_id.eq(tenant_id))
                .filter(documents::id.eq(id))
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn list_documents(
        &self,
        tenant_id: Uuid,
        filter: &DocumentFilter,
    ) -> RepoResult<Vec<Document>> {
        let filter = filter.clone();
        self.run(move |conn| {
            let mut query = documents::table
                .filter(documents::tenant_id.eq(tenant_id))
                .into_boxed();
            if let Some(status) = filter.status {
                query = query.filter(documents::status.eq(status.as_str()));
            }
            Ok(query
                .order(documents::created_at.desc())
                .limit(filter.limit)
                .offset(filter.offset)
                .load(conn)?)
        })
        .await
    }

    async fn delete_document(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<bool> {
        self.run(move |conn| {
            let deleted = diesel::delete(
                documents::table
                    .filter(documents::tenant_id.eq(tenant_id))
                    .filter(documents::id.eq(id)),
            )
            .execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn mark_processing(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        started_at: NaiveDateTime,
    ) -> RepoResult<Document> {
        self.run(move |conn| {
            let to = DocumentStatus::Processing;
            let updated = diesel::update(
                documents::table
                    .filter(documents::tenant_id.eq(tenant_id))
                    .filter(documents::id.eq(id))
                    .filter(documents::status.eq_any(status_strings(to.predecessors()))),
            )
            .set((
                documents::status.eq(to.as_str()),
                documents::processing_started_at.eq(Some(started_at)),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
            finish_transition(conn, tenant_id, id, updated, to)
        })
        .await
    }

    async fn mark_completed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        file: GeneratedFile,
    ) -> RepoResult<Document> {
        self.run(move |conn| {
            let to = DocumentStatus::Completed;
            let updated = diesel::update(
                documents::table
                    .filter(documents::tenant_id.eq(tenant_id))
                    .filter(documents::id.eq(id))
                    .filter(documents::status.eq_any(status_strings(to.predecessors()))),
            )
            .set((
                documents::status.eq(to.as_str()),
                documents::variables.eq(file.variables),
                documents::file_path.eq(Some(file.file_path)),
                documents::file_url.eq(Some(file.file_url)),
                documents::file_size.eq(Some(file.file_size)),
                documents::error_message.eq::<Option<String>>(None),
                documents::processing_completed_at.eq(Some(file.completed_at)),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
            finish_transition(conn, tenant_id, id, updated, to)
        })
        .await
    }

    async fn mark_failed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        error: &str,
        failed_at: NaiveDateTime,
    ) -> RepoResult<Document> {
        let error = error.to_string();
        self.run(move |conn| {
            let to = DocumentStatus::Failed;
            let updated = diesel::update(
                documents::table
                    .filter(documents::tenant_id.eq(tenant_id))
                    .filter(documents::id.eq(id))
                    .filter(documents::status.eq_any(status_strings(to.predecessors()))),
            )
            .set((
                documents::status.eq(to.as_str()),
                documents::error_message.eq(Some(error)),
                documents::processing_completed_at.eq(Some(failed_at)),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
            finish_transition(conn, tenant_id, id, updated, to)
        })
        .await
    }

    async fn mark_uploaded(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        crm_file_id: &str,
    ) -> RepoResult<Document> {
        let crm_file_id = crm_file_id.to_string();
        self.run(move |conn| {
            let to = DocumentStatus::Uploaded;
            let updated = diesel::update(
                documents::table
                    .filter(documents::tenant_id.eq(tenant_id))
                    .filter(documents::id.eq(id))
                    .filter(documents::status.eq_any(status_strings(to.predecessors()))),
            )
            .set((
                documents::status.eq(to.as_str()),
                documents::crm_file_id.eq(Some(crm_file_id)),
                documents::error_message.eq::<Option<String>>(None),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
            finish_transition(conn, tenant_id, id, updated, to)
        })
        .await
    }

    async fn record_crm_file(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        crm_file_id: &str,
    ) -> RepoResult<()> {
        let crm_file_id = crm_file_id.to_string();
        self.run(move |conn| {
            let updated = diesel::update(
                documents::table
                    .filter(documents::tenant_id.eq(tenant_id))
                    .filter(documents::id.eq(id))
                    .filter(documents::status.eq(DocumentStatus::Completed.as_str())),
            )
            .set((
                documents::crm_file_id.eq(Some(crm_file_id)),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
            if updated == 0 {
                let current = documents::table
                    .filter(documents::tenant_id.eq(tenant_id))
                    .filter(documents::id.eq(id))
                    .select(documents::status)
                    .first::<String>(conn)
                    .optional()?
                    .ok_or(RepositoryError::NotFound)?;
                return Err(RepositoryError::InvalidTransition {
                    from: current,
                    to: DocumentStatus::Uploaded,
                });
            }
            Ok(())
        })
        .await
    }

    async fn record_error(&self, tenant_id: Uuid, id: Uuid, error: &str) -> RepoResult<()> {
        let error = error.to_string();
        self.run(move |conn| {
            let updated = diesel::update(
                documents::table
                    .filter(documents::tenant_id.eq(tenant_id))
                    .filter(documents::id.eq(id)),
            )
            .set((
                documents::error_message.eq(Some(error)),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
            if updated == 0 {
                return Err(RepositoryError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn failed_documents_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<Vec<Document>> {
        self.run(move |conn| {
            let mut query = documents::table
                .filter(documents::status.eq(DocumentStatus::Failed.as_str()))
                .filter(documents::updated_at.lt(cutoff))
                .into_boxed();
            if let Some(tenant_id) = tenant_id {
                query = query.filter(documents::tenant_id.eq(tenant_id));
            }
            Ok(query.order(documents::updated_at.asc()).load(conn)?)
        })
        .await
    }

    async fn stale_documents_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<Vec<Document>> {
        self.run(move |conn| {
            let processing = documents::status
                .eq(DocumentStatus::Processing.as_str())
                .and(documents::processing_started_at.lt(cutoff));
            let pending = documents::status
                .eq(DocumentStatus::Pending.as_str())
                .and(documents::created_at.lt(cutoff));

            let mut query = documents::table
                .filter(processing.or(pending))
                .into_boxed();
            if let Some(tenant_id) = tenant_id {
                query = query.filter(documents::tenant_id.eq(tenant_id));
            }
            Ok(query.order(documents::created_at.asc()).load(conn)?)
        })
        .await
    }

    async fn append_audit(&self, entry: NewAuditLog) -> RepoResult<()> {
        self.run(move |conn| {
            diesel::insert_into(audit_logs::table)
                .values(&entry)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn count_audit_logs_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<u64> {
        self.run(move |conn| {
            let mut query = audit_logs::table
                .filter(audit_logs::created_at.lt(cutoff))
                .into_boxed();
            if let Some(tenant_id) = tenant_id {
                query = query.filter(audit_logs::tenant_id.eq(tenant_id));
            }
            let count: i64 = query.count().get_result(conn)?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn delete_audit_logs_before(
        &self,
        cutoff: NaiveDateTime,
        tenant_id: Option<Uuid>,
    ) -> RepoResult<u64> {
        self.run(move |conn| {
            let deleted = match tenant_id {
                Some(tenant_id) => diesel::delete(
                    audit_logs::table
                        .filter(audit_logs::created_at.lt(cutoff))
                        .filter(audit_logs::tenant_id.eq(tenant_id)),
                )
                .execute(conn)?,
                None => diesel::delete(audit_logs::table.filter(audit_logs::created_at.lt(cutoff)))
                    .execute(conn)?,
            };
            Ok(deleted as u64)
        })
        .await
    }
}
