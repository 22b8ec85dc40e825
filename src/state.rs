use std::sync::Arc;

use anyhow::Context;
use reqwest::Client;
use tracing::info;

use crate::{
    auth::jwt::JwtService,
    config::{AppConfig, QueueBackend},
    crm::{CrmApi, HubSpotClient, OAuthClientConfig, TenantTokenProvider},
    db,
    queue::{Broker, MemoryBroker, PgBroker, QueueManager, QueueSettings},
    render::{HttpRenderClient, PdfRenderer},
    repository::{PgRepository, Repository},
    storage::{build_file_store, FileStore},
};

/// Shared handles for the HTTP layer and the pipeline workers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repo: Arc<dyn Repository>,
    pub files: Arc<dyn FileStore>,
    pub queue: Arc<QueueManager>,
    pub crm: Arc<dyn CrmApi>,
    pub renderer: Arc<dyn PdfRenderer>,
    pub jwt: JwtService,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        repo: Arc<dyn Repository>,
        files: Arc<dyn FileStore>,
        queue: Arc<QueueManager>,
        crm: Arc<dyn CrmApi>,
        renderer: Arc<dyn PdfRenderer>,
        jwt: JwtService,
    ) -> Self {
        Self {
            config: Arc::new(config),
            repo,
            files,
            queue,
            crm,
            renderer,
            jwt,
        }
    }
}

/// Wires the production collaborators from configuration. The queue manager
/// is created but not started.
pub async fn build_state(config: AppConfig, pool_size: u32) -> anyhow::Result<AppState> {
    let pool = db::init_pool_with_size(&config.database_url, pool_size)?;
    crate::run_migrations(&pool)?;

    let repo: Arc<dyn Repository> = Arc::new(PgRepository::new(pool.clone()));
    let files = build_file_store(&config).await?;

    let broker: Arc<dyn Broker> = match config.queue_backend {
        QueueBackend::Postgres => Arc::new(PgBroker::new(pool)),
        QueueBackend::Memory => Arc::new(MemoryBroker::new()),
    };
    let queue = QueueManager::new(broker, QueueSettings::from_config(&config));

    let http = Client::builder()
        .user_agent(concat!("docforge/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    let tokens = Arc::new(TenantTokenProvider::new(
        Arc::clone(&repo),
        http.clone(),
        OAuthClientConfig {
            token_url: config.crm_token_url.clone(),
            client_id: config.crm_client_id.clone(),
            client_secret: config.crm_client_secret.clone(),
        },
    ));
    let crm: Arc<dyn CrmApi> = Arc::new(HubSpotClient::new(
        http.clone(),
        config.crm_api_base.clone(),
        tokens,
    ));
    let renderer: Arc<dyn PdfRenderer> = Arc::new(HttpRenderClient::new(
        http,
        config.render_url.clone(),
        config.render_timeout,
    ));
    let jwt = JwtService::from_config(&config);

    info!(
        storage = ?config.storage_backend,
        queue = ?config.queue_backend,
        render_url = %config.render_url,
        "application state ready"
    );
    Ok(AppState::new(config, repo, files, queue, crm, renderer, jwt))
}
