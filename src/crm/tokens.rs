use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::CrmError;
use crate::models::{Tenant, TokenUpdate};
use crate::repository::Repository;

/// Refresh when the stored token expires within this window.
const REFRESH_MARGIN_SECONDS: i64 = 60;

#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn access_token(&self, tenant_id: Uuid) -> Result<String, CrmError>;
}

#[derive(Clone, Debug)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Reads tenant tokens from the repository and refreshes them through the
/// OAuth2 refresh-token grant when they are about to expire.
pub struct TenantTokenProvider {
    repo: Arc<dyn Repository>,
    http: Client,
    oauth: OAuthClientConfig,
    refresh_lock: Mutex<()>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

impl TenantTokenProvider {
    pub fn new(repo: Arc<dyn Repository>, http: Client, oauth: OAuthClientConfig) -> Self {
        Self {
            repo,
            http,
            oauth,
            refresh_lock: Mutex::new(()),
        }
    }

    async fn load_tenant(&self, tenant_id: Uuid) -> Result<Tenant, CrmError> {
        let tenant = self
            .repo
            .get_tenant(tenant_id)
            .await
            .map_err(|err| CrmError::Token(err.to_string()))?
            .ok_or_else(|| CrmError::Token(format!("unknown tenant {tenant_id}")))?;

        if !tenant.is_active {
            return Err(CrmError::Token(format!("tenant {tenant_id} is inactive")));
        }
        Ok(tenant)
    }

    async fn refresh(&self, tenant: &Tenant) -> Result<String, CrmError> {
        let refresh_token = tenant
            .refresh_token
            .clone()
            .ok_or_else(|| CrmError::Token("tenant has no refresh token".into()))?;

        let response = self
            .http
            .post(&self.oauth.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Token(format!(
                "token refresh failed with status {status}: {body}"
            )));
        }

        let refreshed: RefreshResponse = response.json().await?;
        let update = TokenUpdate {
            access_token: refreshed.access_token.clone(),
            refresh_token: refreshed.refresh_token.unwrap_or(refresh_token),
            expires_at: (Utc::now() + Duration::seconds(refreshed.expires_in)).naive_utc(),
        };
        self.repo
            .update_tenant_tokens(tenant.id, update)
            .await
            .map_err(|err| CrmError::Token(err.to_string()))?;

        info!(tenant_id = %tenant.id, "refreshed CRM access token");
        Ok(refreshed.access_token)
    }
}

fn usable_token(tenant: &Tenant) -> Option<String> {
    let token = tenant.access_token.clone()?;
    let expires_at = tenant.token_expires_at?;
    let cutoff = (Utc::now() + Duration::seconds(REFRESH_MARGIN_SECONDS)).naive_utc();
    (expires_at > cutoff).then_some(token)
}

#[async_trait]
impl TokenProvider for TenantTokenProvider {
    async fn access_token(&self, tenant_id: Uuid) -> Result<String, CrmError> {
        let tenant = self.load_tenant(tenant_id).await?;
        if let Some(token) = usable_token(&tenant) {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // another task may have refreshed while we waited
        let tenant = self.load_tenant(tenant_id).await?;
        if let Some(token) = usable_token(&tenant) {
            return Ok(token);
        }
        self.refresh(&tenant).await
    }
}
