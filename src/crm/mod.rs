//! CRM collaborator: object reads, file upload and record attachment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::CrmObjectType;
use crate::variables::VariableMap;

pub mod hubspot;
pub mod tokens;

pub use hubspot::HubSpotClient;
pub use tokens::{OAuthClientConfig, TenantTokenProvider, TokenProvider};

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("CRM rejected credentials")]
    Unauthorized,
    #[error("CRM object not found")]
    NotFound,
    #[error("CRM rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("CRM responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("CRM request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("CRM token unavailable: {0}")]
    Token(String),
}

impl CrmError {
    /// Whether a later attempt may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrmError::RateLimited { .. } | CrmError::Transport(_) | CrmError::Unauthorized => true,
            CrmError::Status { status, .. } => *status >= 500,
            CrmError::NotFound | CrmError::Token(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrmObject {
    pub id: String,
    pub properties: VariableMap,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub folder_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub property_type: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContactSearch {
    pub query: Option<String>,
    pub limit: u32,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub total: u64,
    pub results: Vec<CrmObject>,
    pub next_after: Option<String>,
}

#[async_trait]
pub trait CrmApi: Send + Sync + 'static {
    async fn get_object(
        &self,
        tenant_id: Uuid,
        object_type: CrmObjectType,
        object_id: &str,
        properties: &[String],
    ) -> Result<CrmObject, CrmError>;

    async fn search_contacts(
        &self,
        tenant_id: Uuid,
        search: &ContactSearch,
    ) -> Result<SearchResults, CrmError>;

    async fn upload_file(
        &self,
        tenant_id: Uuid,
        file_name: &str,
        bytes: Vec<u8>,
        options: &UploadOptions,
    ) -> Result<UploadedFile, CrmError>;

    async fn attach_file(
        &self,
        tenant_id: Uuid,
        file_id: &str,
        object_type: CrmObjectType,
        object_id: &str,
    ) -> Result<(), CrmError>;

    async fn get_properties(
        &self,
        tenant_id: Uuid,
        object_type: CrmObjectType,
    ) -> Result<Vec<PropertyDescriptor>, CrmError>;
}
