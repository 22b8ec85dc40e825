use anyhow::Result;
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    primitives::ByteStream,
    Client as S3Client,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    document_path, public_url, validate_relative, FileStat, FileStore, PurgeReport, SaveRequest,
    StorageError, StorageResult, StoredFile,
};
use crate::config::AppConfig;

const TEMP_PREFIX: &str = "tmp/";

pub async fn build_client(config: &AppConfig) -> Result<S3Client> {
    let region = Region::new(config.aws_region.clone());
    let region_provider = RegionProviderChain::first_try(Some(region))
        .or_default_provider()
        .or_else("us-east-1");

    #[allow(deprecated)]
    let mut loader = aws_config::from_env().region(region_provider);

    if let Some(endpoint) = &config.aws_endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    if let (Some(access_key), Some(secret_key)) = (
        config.aws_access_key_id.clone(),
        config.aws_secret_access_key.clone(),
    ) {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");
        loader = loader.credentials_provider(credentials);
    }

    let base_config = loader.load().await;
    let s3_config = S3ConfigBuilder::from(&base_config)
        .force_path_style(true)
        .build();

    Ok(S3Client::from_conf(s3_config))
}

/// Stores generated files as objects in a single bucket, keyed by their
/// relative path.
pub struct S3FileStore {
    client: S3Client,
    bucket: String,
    base_url: String,
}

impl S3FileStore {
    pub fn new(client: S3Client, bucket: impl Into<String>, base_url: &str) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            base_url: base_url.to_string(),
        }
    }
}

fn backend<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> StorageError + '_ {
    move |err| StorageError::Backend(format!("{context}: {err}"))
}

/// `tmp/{random}_{file}` for a final object path.
fn staging_key(path: &str) -> String {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    format!("{TEMP_PREFIX}{}_{}", Uuid::new_v4(), file_name)
}

fn to_chrono(value: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(value.secs(), value.subsec_nanos())
}

#[async_trait]
impl FileStore for S3FileStore {
    async fn save(&self, request: SaveRequest) -> StorageResult<StoredFile> {
        let path = document_path(
            request.tenant_id,
            request.document_id,
            &request.file_name,
            Utc::now(),
        );
        let size = request.bytes.len() as u64;
        let staged = staging_key(&path);

        // an interrupted save leaves only the staged object under the temp prefix
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&staged)
            .content_type("application/pdf")
            .body(ByteStream::from(request.bytes))
            .send()
            .await
            .map_err(backend("failed to upload object to S3"))?;

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, staged))
            .key(&path)
            .send()
            .await
            .map_err(backend("failed to move staged object into place"))?;

        if let Err(err) = self.delete(&staged).await {
            warn!(key = %staged, error = %err, "failed to remove staged object");
        }

        debug!(%path, size, "stored object");
        Ok(StoredFile {
            url: self.public_url(&path),
            path,
            size,
        })
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        validate_relative(path)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|err| {
                let err = err.into_service_error();
                if err.is_no_such_key() {
                    StorageError::NotFound(path.to_string())
                } else {
                    StorageError::Backend(format!("failed to download object from S3: {err}"))
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(backend("failed to read object stream"))?
            .into_bytes()
            .to_vec();
        Ok(bytes)
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        validate_relative(path)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(backend("failed to delete object from S3"))?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> StorageResult<FileStat> {
        validate_relative(path)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(head) => Ok(FileStat {
                exists: true,
                size: head.content_length().map(|len| len.max(0) as u64),
                created_at: None,
                modified_at: head.last_modified().and_then(to_chrono),
            }),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    Ok(FileStat::default())
                } else {
                    Err(StorageError::Backend(format!("failed to stat object: {err}")))
                }
            }
        }
    }

    async fn cleanup_older_than(&self, hours: u64, dry_run: bool) -> StorageResult<PurgeReport> {
        let cutoff = Utc::now() - Duration::hours(hours as i64);
        let mut report = PurgeReport::default();
        let mut continuation: Option<String> = None;

        loop {
            let listing = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(TEMP_PREFIX)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(backend("failed to list temp objects"))?;

            for object in listing.contents() {
                let Some(key) = object.key() else { continue };
                let expired = object
                    .last_modified()
                    .and_then(to_chrono)
                    .is_some_and(|modified| modified < cutoff);
                if !expired {
                    continue;
                }

                report.matched += 1;
                report.bytes += object.size().unwrap_or_default().max(0) as u64;
                if !dry_run {
                    self.delete(key).await?;
                    report.removed += 1;
                }
            }

            match listing.next_continuation_token() {
                Some(token) if listing.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(report)
    }

    fn public_url(&self, path: &str) -> String {
        public_url(&self.base_url, path)
    }
}
