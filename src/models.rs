use std::{fmt, str::FromStr};

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::*;
use crate::variables::{map_from_json, VariableMap};

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = tenants)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub portal_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<NaiveDateTime>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tenants)]
pub struct NewTenant {
    pub id: Uuid,
    pub name: String,
    pub portal_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = users)]
#[diesel(belongs_to(Tenant))]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = templates)]
#[diesel(belongs_to(Tenant))]
pub struct Template {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub created_by: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub variables: serde_json::Value,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Template {
    pub fn declarations(&self) -> Result<Vec<VariableDeclaration>, serde_json::Error> {
        serde_json::from_value(self.variables.clone())
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = templates)]
pub struct NewTemplate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub created_by: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub variables: serde_json::Value,
    pub is_active: bool,
}

/// Partial template update; `None` leaves the column untouched.
#[derive(Debug, Default, Clone, AsChangeset)]
#[diesel(table_name = templates)]
pub struct TemplateChanges {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub content: Option<String>,
    pub variables: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

impl TemplateChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.content.is_none()
            && self.variables.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = documents)]
#[diesel(belongs_to(Template))]
pub struct Document {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub template_id: Uuid,
    pub name: String,
    pub variables: serde_json::Value,
    pub crm_object_id: Option<String>,
    pub crm_object_type: Option<String>,
    pub status: String,
    pub file_path: Option<String>,
    pub file_url: Option<String>,
    pub file_size: Option<i64>,
    pub crm_file_id: Option<String>,
    pub error_message: Option<String>,
    pub processing_started_at: Option<NaiveDateTime>,
    pub processing_completed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Document {
    pub fn status(&self) -> Option<DocumentStatus> {
        self.status.parse().ok()
    }

    pub fn crm_object(&self) -> Option<CrmObjectRef> {
        let object_id = self.crm_object_id.as_ref()?;
        let object_type = self.crm_object_type.as_deref()?.parse().ok()?;
        Some(CrmObjectRef {
            object_id: object_id.clone(),
            object_type,
        })
    }

    pub fn variable_values(&self) -> VariableMap {
        map_from_json(&self.variables)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub template_id: Uuid,
    pub name: String,
    pub variables: serde_json::Value,
    pub crm_object_id: Option<String>,
    pub crm_object_type: Option<String>,
    pub status: String,
}

/// File fields written when a document reaches `COMPLETED`.
#[derive(Debug, Clone)]
pub struct GeneratedFile {
    pub variables: serde_json::Value,
    pub file_path: String,
    pub file_url: String,
    pub file_size: i64,
    pub completed_at: NaiveDateTime,
}

#[derive(Debug, Default, Clone)]
pub struct DocumentFilter {
    pub status: Option<DocumentStatus>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = audit_logs)]
pub struct AuditLog {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = audit_logs)]
pub struct NewAuditLog {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
}

impl NewAuditLog {
    pub fn document(action: &str, document: &Document) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: Some(document.tenant_id),
            user_id: Some(document.user_id),
            action: action.to_string(),
            entity_type: "document".to_string(),
            entity_id: Some(document.id.to_string()),
            old_values: None,
            new_values: None,
        }
    }

    pub fn with_old(mut self, values: serde_json::Value) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn with_new(mut self, values: serde_json::Value) -> Self {
        self.new_values = Some(values);
        self
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub job_key: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub stalled_count: i32,
    pub progress: i32,
    pub run_after: NaiveDateTime,
    pub locked_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub finished_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJobRow {
    pub id: Uuid,
    pub queue: String,
    pub job_key: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i32,
    pub max_attempts: i32,
    pub run_after: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Uploaded,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Completed => "COMPLETED",
            DocumentStatus::Uploaded => "UPLOADED",
            DocumentStatus::Failed => "FAILED",
        }
    }

    /// States a document may be in immediately before entering `self`.
    ///
    /// `PROCESSING -> PROCESSING` covers a retried attempt of the same job.
    pub fn predecessors(&self) -> &'static [DocumentStatus] {
        match self {
            DocumentStatus::Pending => &[],
            DocumentStatus::Processing => &[DocumentStatus::Pending, DocumentStatus::Processing],
            DocumentStatus::Completed => &[DocumentStatus::Processing],
            DocumentStatus::Uploaded => &[DocumentStatus::Completed],
            DocumentStatus::Failed => &[DocumentStatus::Processing],
        }
    }

    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        next.predecessors().contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed | DocumentStatus::Uploaded | DocumentStatus::Failed
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DocumentStatus::Pending),
            "PROCESSING" => Ok(DocumentStatus::Processing),
            "COMPLETED" => Ok(DocumentStatus::Completed),
            "UPLOADED" => Ok(DocumentStatus::Uploaded),
            "FAILED" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrmObjectType {
    Contact,
    Deal,
    Company,
    Ticket,
}

impl CrmObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrmObjectType::Contact => "CONTACT",
            CrmObjectType::Deal => "DEAL",
            CrmObjectType::Company => "COMPANY",
            CrmObjectType::Ticket => "TICKET",
        }
    }

    /// Variable namespace used in template placeholders (`{{deal.amount}}`).
    pub fn namespace(&self) -> &'static str {
        match self {
            CrmObjectType::Contact => "contact",
            CrmObjectType::Deal => "deal",
            CrmObjectType::Company => "company",
            CrmObjectType::Ticket => "ticket",
        }
    }

    /// Path segment of the CRM objects API.
    pub fn api_path(&self) -> &'static str {
        match self {
            CrmObjectType::Contact => "contacts",
            CrmObjectType::Deal => "deals",
            CrmObjectType::Company => "companies",
            CrmObjectType::Ticket => "tickets",
        }
    }
}

impl fmt::Display for CrmObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrmObjectType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "CONTACT" | "CONTACTS" => Ok(CrmObjectType::Contact),
            "DEAL" | "DEALS" => Ok(CrmObjectType::Deal),
            "COMPANY" | "COMPANIES" => Ok(CrmObjectType::Company),
            "TICKET" | "TICKETS" => Ok(CrmObjectType::Ticket),
            other => Err(format!("unknown CRM object type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmObjectRef {
    pub object_id: String,
    pub object_type: CrmObjectType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableKind {
    #[serde(rename = "contact.property")]
    ContactProperty,
    #[serde(rename = "deal.property")]
    DealProperty,
    #[serde(rename = "company.property")]
    CompanyProperty,
    #[serde(rename = "custom")]
    Custom,
}

impl VariableKind {
    pub fn crm_object_type(&self) -> Option<CrmObjectType> {
        match self {
            VariableKind::ContactProperty => Some(CrmObjectType::Contact),
            VariableKind::DealProperty => Some(CrmObjectType::Deal),
            VariableKind::CompanyProperty => Some(CrmObjectType::Company),
            VariableKind::Custom => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub kind: VariableKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl VariableDeclaration {
    /// Property looked up on the CRM object: the part after the namespace dot.
    pub fn property_name(&self) -> &str {
        self.name
            .split_once('.')
            .map(|(_, property)| property)
            .unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_only_legal_status_edges() {
        use DocumentStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Uploaded));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Uploaded));
        assert!(!Processing.can_transition_to(Uploaded));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Uploaded.can_transition_to(Completed));
    }

    #[test]
    fn parses_status_case_insensitively() {
        assert_eq!("failed".parse::<DocumentStatus>(), Ok(DocumentStatus::Failed));
        assert!("archived".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn parses_declarations_from_json() {
        let raw = serde_json::json!([
            {"name": "deal.amount", "label": "Amount", "type": "deal.property", "required": true},
            {"name": "notes", "type": "custom", "default_value": "n/a"}
        ]);
        let parsed: Vec<VariableDeclaration> = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed[0].kind, VariableKind::DealProperty);
        assert_eq!(parsed[0].property_name(), "amount");
        assert_eq!(parsed[1].property_name(), "notes");
        assert_eq!(parsed[1].default_value.as_deref(), Some("n/a"));
        assert!(!parsed[1].required);
    }

    #[test]
    fn maps_object_types_to_namespaces() {
        assert_eq!(CrmObjectType::Deal.namespace(), "deal");
        assert_eq!(CrmObjectType::Company.api_path(), "companies");
        assert_eq!("contacts".parse::<CrmObjectType>(), Ok(CrmObjectType::Contact));
    }
}
