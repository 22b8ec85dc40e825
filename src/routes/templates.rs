use std::collections::{BTreeSet, HashSet};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::timestamp;
use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{NewAuditLog, NewTemplate, Template, TemplateChanges, VariableDeclaration};
use crate::state::AppState;
use crate::utils::json::{classify_nullable, optional_field};
use crate::variables::extract_variable_names;

#[derive(Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Serialize)]
pub struct TemplateResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub variables: Value,
    pub is_active: bool,
    pub created_by: Option<Uuid>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Template> for TemplateResponse {
    fn from(template: Template) -> Self {
        Self {
            id: template.id,
            name: template.name,
            description: template.description,
            content: template.content,
            variables: template.variables,
            is_active: template.is_active,
            created_by: template.created_by,
            created_at: timestamp(template.created_at),
            updated_at: timestamp(template.updated_at),
        }
    }
}

#[derive(Serialize)]
pub struct TemplateVariablesResponse {
    pub declared: Vec<VariableDeclaration>,
    /// Placeholder names found in the HTML.
    pub detected: BTreeSet<String>,
    /// Detected but not declared; these render from supplied values only.
    pub undeclared: Vec<String>,
}

fn validate_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn validate_declarations(declarations: &[VariableDeclaration]) -> AppResult<()> {
    let mut seen = HashSet::new();
    for declaration in declarations {
        if declaration.name.trim().is_empty() {
            return Err(AppError::bad_request("variable names must not be empty"));
        }
        if !seen.insert(declaration.name.as_str()) {
            return Err(AppError::bad_request(format!(
                "variable {} is declared more than once",
                declaration.name
            )));
        }
    }
    Ok(())
}

async fn load_template(state: &AppState, tenant_id: Uuid, id: Uuid) -> AppResult<Template> {
    state
        .repo
        .get_template(tenant_id, id)
        .await?
        .ok_or_else(AppError::not_found)
}

pub async fn list_templates(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<TemplateResponse>>> {
    let templates = state.repo.list_templates(user.tenant_id).await?;
    Ok(Json(templates.into_iter().map(Into::into).collect()))
}

pub async fn get_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<TemplateResponse>> {
    let template = load_template(&state, user.tenant_id, template_id).await?;
    Ok(Json(template.into()))
}

pub async fn create_template(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateTemplateRequest>,
) -> AppResult<(StatusCode, Json<TemplateResponse>)> {
    let name = validate_name(&payload.name)?;
    if payload.content.trim().is_empty() {
        return Err(AppError::bad_request("content must not be empty"));
    }
    validate_declarations(&payload.variables)?;

    let template = state
        .repo
        .create_template(NewTemplate {
            id: Uuid::new_v4(),
            tenant_id: user.tenant_id,
            created_by: Some(user.user_id),
            name,
            description: payload.description,
            content: payload.content,
            variables: serde_json::to_value(&payload.variables)?,
            is_active: payload.is_active,
        })
        .await?;

    state
        .repo
        .append_audit(template_audit("template.created", &template, user.user_id))
        .await?;
    info!(template_id = %template.id, tenant_id = %template.tenant_id, "template created");

    Ok((StatusCode::CREATED, Json(template.into())))
}

pub async fn update_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(body): Json<Value>,
) -> AppResult<Json<TemplateResponse>> {
    if !body.is_object() {
        return Err(AppError::bad_request("expected a JSON object"));
    }

    let name = optional_field::<String>(&body, "name")
        .map_err(AppError::bad_request)?
        .map(|name| validate_name(&name))
        .transpose()?;
    let content = optional_field::<String>(&body, "content").map_err(AppError::bad_request)?;
    if content.as_deref().is_some_and(|content| content.trim().is_empty()) {
        return Err(AppError::bad_request("content must not be empty"));
    }
    let variables = optional_field::<Vec<VariableDeclaration>>(&body, "variables")
        .map_err(AppError::bad_request)?;
    if let Some(declarations) = variables.as_deref() {
        validate_declarations(declarations)?;
    }
    let description = classify_nullable(body.get("description"))
        .map_err(AppError::bad_request)?
        .into_change();

    let changes = TemplateChanges {
        name,
        description,
        content,
        variables: variables.map(serde_json::to_value).transpose()?,
        is_active: optional_field(&body, "is_active").map_err(AppError::bad_request)?,
    };

    let template = state
        .repo
        .update_template(user.tenant_id, template_id, changes)
        .await?;
    state
        .repo
        .append_audit(
            template_audit("template.updated", &template, user.user_id).with_new(body.clone()),
        )
        .await?;

    Ok(Json(template.into()))
}

pub async fn delete_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<StatusCode> {
    let template = load_template(&state, user.tenant_id, template_id).await?;
    let in_use = state
        .repo
        .count_template_documents(user.tenant_id, template_id)
        .await?;
    if in_use > 0 {
        return Err(AppError::conflict(format!(
            "template is used by {in_use} document(s) and cannot be deleted"
        )));
    }

    state
        .repo
        .delete_template(user.tenant_id, template_id)
        .await?;
    state
        .repo
        .append_audit(template_audit("template.deleted", &template, user.user_id))
        .await?;
    info!(template_id = %template_id, tenant_id = %user.tenant_id, "template deleted");

    Ok(StatusCode::NO_CONTENT)
}

/// Copies a template as `<name> (copy)`; the copy starts inactive.
pub async fn duplicate_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<(StatusCode, Json<TemplateResponse>)> {
    let source = load_template(&state, user.tenant_id, template_id).await?;

    let copy = state
        .repo
        .create_template(NewTemplate {
            id: Uuid::new_v4(),
            tenant_id: user.tenant_id,
            created_by: Some(user.user_id),
            name: format!("{} (copy)", source.name),
            description: source.description.clone(),
            content: source.content.clone(),
            variables: source.variables.clone(),
            is_active: false,
        })
        .await?;
    state
        .repo
        .append_audit(
            template_audit("template.duplicated", &copy, user.user_id)
                .with_old(json!({ "source_template_id": source.id })),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(copy.into())))
}

pub async fn template_variables(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<TemplateVariablesResponse>> {
    let template = load_template(&state, user.tenant_id, template_id).await?;
    let declared = template
        .declarations()
        .map_err(|err| AppError::internal(format!("stored declarations are malformed: {err}")))?;
    let detected = extract_variable_names(&template.content);
    let declared_names: HashSet<&str> = declared.iter().map(|d| d.name.as_str()).collect();
    let undeclared = detected
        .iter()
        .filter(|name| !declared_names.contains(name.as_str()))
        .cloned()
        .collect();

    Ok(Json(TemplateVariablesResponse {
        declared,
        detected,
        undeclared,
    }))
}

fn template_audit(action: &str, template: &Template, user_id: Uuid) -> NewAuditLog {
    NewAuditLog {
        id: Uuid::new_v4(),
        tenant_id: Some(template.tenant_id),
        user_id: Some(user_id),
        action: action.to_string(),
        entity_type: "template".to_string(),
        entity_id: Some(template.id.to_string()),
        old_values: None,
        new_values: Some(json!({
            "name": template.name,
            "is_active": template.is_active,
        })),
    }
}
