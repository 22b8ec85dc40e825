//! Generated-file persistence behind a small trait, with filesystem and S3
//! backends.

use std::path::{Component, Path};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{AppConfig, StorageBackend};

mod local;
mod s3;

pub use local::LocalFileStore;
pub use s3::{build_client, S3FileStore};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub tenant_id: Uuid,
    pub document_id: Uuid,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: String,
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStat {
    pub exists: bool,
    pub size: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Outcome of a temp-directory sweep. `removed` stays zero on a dry run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub matched: u64,
    pub removed: u64,
    pub bytes: u64,
}

#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    async fn save(&self, request: SaveRequest) -> StorageResult<StoredFile>;
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;
    /// Deleting a missing file succeeds.
    async fn delete(&self, path: &str) -> StorageResult<()>;
    async fn stat(&self, path: &str) -> StorageResult<FileStat>;
    async fn cleanup_older_than(&self, hours: u64, dry_run: bool) -> StorageResult<PurgeReport>;
    fn public_url(&self, path: &str) -> String;
}

/// `documents/{tenant}/{YYYY}/{MM}/{document}_{file}`
pub fn document_path(
    tenant_id: Uuid,
    document_id: Uuid,
    file_name: &str,
    now: DateTime<Utc>,
) -> String {
    format!(
        "documents/{}/{:04}/{:02}/{}_{}",
        tenant_id,
        now.year(),
        now.month(),
        document_id,
        sanitize_file_name(file_name)
    )
}

/// Keeps ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "document.pdf".to_string()
    } else {
        cleaned.to_string()
    }
}

pub(crate) fn public_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/files/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Rejects absolute paths and parent-directory segments.
pub(crate) fn validate_relative(path: &str) -> StorageResult<&Path> {
    let candidate = Path::new(path);
    let safe = !path.is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if safe {
        Ok(candidate)
    } else {
        Err(StorageError::InvalidPath(path.to_string()))
    }
}

pub async fn build_file_store(config: &AppConfig) -> Result<Arc<dyn FileStore>> {
    match config.storage_backend {
        StorageBackend::Local => {
            let store = LocalFileStore::new(
                &config.storage_root,
                &config.storage_temp_dir,
                &config.public_base_url,
            )?;
            Ok(Arc::new(store))
        }
        StorageBackend::S3 => {
            let Some(bucket) = config.s3_bucket.clone() else {
                bail!("S3_BUCKET must be set when STORAGE_BACKEND=s3");
            };
            let client = build_client(config).await?;
            Ok(Arc::new(S3FileStore::new(
                client,
                bucket,
                &config.public_base_url,
            )))
        }
    }
}
