use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ContactSearch, CrmApi, CrmError, CrmObject, PropertyDescriptor, SearchResults, TokenProvider,
    UploadOptions, UploadedFile,
};
use crate::models::CrmObjectType;
use crate::variables::map_from_json;

const SEARCH_PROPERTIES: &[&str] = &["firstname", "lastname", "email", "company"];
const MAX_SEARCH_LIMIT: u32 = 100;

/// REST client for the HubSpot CRM API.
pub struct HubSpotClient {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HubSpotClient {
    pub fn new(http: Client, base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, tenant_id: Uuid, request: RequestBuilder) -> Result<Response, CrmError> {
        let token = self.tokens.access_token(tenant_id).await?;
        let response = request.bearer_auth(token).send().await?;
        check_status(response).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResponse {
    id: String,
    #[serde(default)]
    properties: Value,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<ObjectResponse> for CrmObject {
    fn from(raw: ObjectResponse) -> Self {
        CrmObject {
            id: raw.id,
            properties: map_from_json(&raw.properties),
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    results: Vec<ObjectResponse>,
    paging: Option<Paging>,
}

#[derive(Deserialize)]
struct Paging {
    next: Option<PagingNext>,
}

#[derive(Deserialize)]
struct PagingNext {
    after: String,
}

#[derive(Deserialize)]
struct PropertiesResponse {
    #[serde(default)]
    results: Vec<PropertyDescriptor>,
}

#[async_trait]
impl CrmApi for HubSpotClient {
    async fn get_object(
        &self,
        tenant_id: Uuid,
        object_type: CrmObjectType,
        object_id: &str,
        properties: &[String],
    ) -> Result<CrmObject, CrmError> {
        let url = self.url(&format!(
            "/crm/v3/objects/{}/{}",
            object_type.api_path(),
            object_id
        ));
        let mut request = self.http.get(url);
        if !properties.is_empty() {
            request = request.query(&[("properties", properties.join(","))]);
        }

        let response = self.send(tenant_id, request).await?;
        let object: ObjectResponse = response.json().await?;
        debug!(%tenant_id, object_type = %object_type, object_id, "fetched CRM object");
        Ok(object.into())
    }

    async fn search_contacts(
        &self,
        tenant_id: Uuid,
        search: &ContactSearch,
    ) -> Result<SearchResults, CrmError> {
        let limit = search.limit.clamp(1, MAX_SEARCH_LIMIT);
        let mut body = json!({
            "limit": limit,
            "properties": SEARCH_PROPERTIES,
        });
        if let Some(query) = search.query.as_deref().filter(|q| !q.trim().is_empty()) {
            body["query"] = json!(query.trim());
        }
        if let Some(after) = &search.after {
            body["after"] = json!(after);
        }

        let request = self
            .http
            .post(self.url("/crm/v3/objects/contacts/search"))
            .json(&body);
        let response: SearchResponse = self.send(tenant_id, request).await?.json().await?;

        Ok(SearchResults {
            total: response.total,
            next_after: response.paging.and_then(|p| p.next).map(|next| next.after),
            results: response.results.into_iter().map(CrmObject::from).collect(),
        })
    }

    async fn upload_file(
        &self,
        tenant_id: Uuid,
        file_name: &str,
        bytes: Vec<u8>,
        options: &UploadOptions,
    ) -> Result<UploadedFile, CrmError> {
        let file_part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/pdf")?;
        let form = multipart::Form::new()
            .part("file", file_part)
            .text("folderPath", options.folder_path.clone())
            .text(
                "options",
                json!({ "access": "PRIVATE", "overwrite": false }).to_string(),
            );

        let request = self.http.post(self.url("/files/v3/files")).multipart(form);
        let uploaded: UploadedFile = self.send(tenant_id, request).await?.json().await?;
        debug!(%tenant_id, file_id = %uploaded.id, "uploaded file to CRM");
        Ok(uploaded)
    }

    async fn attach_file(
        &self,
        tenant_id: Uuid,
        file_id: &str,
        object_type: CrmObjectType,
        object_id: &str,
    ) -> Result<(), CrmError> {
        let body = json!({
            "properties": {
                "hs_timestamp": Utc::now().to_rfc3339(),
                "hs_note_body": "Generated document attached",
                "hs_attachment_ids": file_id,
            },
            "associations": [{
                "to": { "id": object_id },
                "types": [{
                    "associationCategory": "HUBSPOT_DEFINED",
                    "associationTypeId": note_association_type(object_type),
                }],
            }],
        });

        let request = self
            .http
            .post(self.url("/crm/v3/objects/notes"))
            .json(&body);
        self.send(tenant_id, request).await?;
        Ok(())
    }

    async fn get_properties(
        &self,
        tenant_id: Uuid,
        object_type: CrmObjectType,
    ) -> Result<Vec<PropertyDescriptor>, CrmError> {
        let url = self.url(&format!("/crm/v3/properties/{}", object_type.api_path()));
        let response: PropertiesResponse =
            self.send(tenant_id, self.http.get(url)).await?.json().await?;
        Ok(response.results)
    }
}

/// HubSpot-defined association type ids for note -> record.
fn note_association_type(object_type: CrmObjectType) -> u32 {
    match object_type {
        CrmObjectType::Contact => 202,
        CrmObjectType::Company => 190,
        CrmObjectType::Deal => 214,
        CrmObjectType::Ticket => 228,
    }
}

async fn check_status(response: Response) -> Result<Response, CrmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CrmError::Unauthorized),
        StatusCode::NOT_FOUND => Err(CrmError::NotFound),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());
            warn!(?retry_after_secs, "CRM rate limit hit");
            Err(CrmError::RateLimited { retry_after_secs })
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(CrmError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}
