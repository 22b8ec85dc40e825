use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::task;
use tracing::{debug, warn};

use super::{
    document_path, public_url, validate_relative, FileStat, FileStore, PurgeReport, SaveRequest,
    StorageError, StorageResult, StoredFile,
};

const STAGING_PREFIX: &str = "docforge-";

/// Stores files below a root directory on the local filesystem.
pub struct LocalFileStore {
    root: PathBuf,
    temp_dir: PathBuf,
    base_url: String,
}

impl LocalFileStore {
    pub fn new(
        root: impl AsRef<Path>,
        temp_dir: impl AsRef<Path>,
        base_url: &str,
    ) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let temp_dir = temp_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            root,
            temp_dir,
            base_url: base_url.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        Ok(self.root.join(validate_relative(path)?))
    }
}

fn not_found_or_io(path: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Io(err)
    }
}

/// Writes into a staging file under `staging` and renames it onto `target`.
/// A crash mid-write leaves the partial file in `staging`, where the temp
/// sweep reclaims it. When the rename crosses filesystems the file is staged
/// next to the target instead.
fn write_atomically(staging: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;
    fs::create_dir_all(staging)?;

    match stage(staging, bytes)?.persist(target) {
        Ok(_) => Ok(()),
        Err(err) => {
            debug!(error = %err.error, "staged rename failed; staging beside the target");
            stage(parent, bytes)?
                .persist(target)
                .map(|_| ())
                .map_err(|err| err.error)
        }
    }
}

fn stage(dir: &Path, bytes: &[u8]) -> std::io::Result<NamedTempFile> {
    let mut temp = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(".part")
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

fn purge_dir(dir: &Path, cutoff: SystemTime, dry_run: bool) -> std::io::Result<PurgeReport> {
    let mut report = PurgeReport::default();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                pending.push(entry.path());
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::now());
            if modified >= cutoff {
                continue;
            }

            report.matched += 1;
            report.bytes += metadata.len();
            if dry_run {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => report.removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "failed to remove temp file")
                }
            }
        }
    }
    Ok(report)
}

fn join_error(err: task::JoinError) -> StorageError {
    StorageError::Backend(format!("storage task failed: {err}"))
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(&self, request: SaveRequest) -> StorageResult<StoredFile> {
        let path = document_path(
            request.tenant_id,
            request.document_id,
            &request.file_name,
            Utc::now(),
        );
        let target = self.resolve(&path)?;
        let size = request.bytes.len() as u64;
        let bytes = request.bytes;
        let staging = self.temp_dir.clone();

        task::spawn_blocking(move || write_atomically(&staging, &target, &bytes))
            .await
            .map_err(join_error)??;

        debug!(%path, size, "stored file");
        Ok(StoredFile {
            url: self.public_url(&path),
            path,
            size,
        })
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|err| not_found_or_io(path, err))
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn stat(&self, path: &str) -> StorageResult<FileStat> {
        let target = self.resolve(path)?;
        match tokio::fs::metadata(&target).await {
            Ok(metadata) => Ok(FileStat {
                exists: true,
                size: Some(metadata.len()),
                created_at: metadata.created().ok().map(DateTime::<Utc>::from),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(FileStat::default()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn cleanup_older_than(&self, hours: u64, dry_run: bool) -> StorageResult<PurgeReport> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(hours.saturating_mul(3600)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let dir = self.temp_dir.clone();
        let report = task::spawn_blocking(move || purge_dir(&dir, cutoff, dry_run))
            .await
            .map_err(join_error)??;
        Ok(report)
    }

    fn public_url(&self, path: &str) -> String {
        public_url(&self.base_url, path)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn store(dir: &Path) -> LocalFileStore {
        LocalFileStore::new(dir.join("files"), dir.join("tmp"), "http://localhost:3000").unwrap()
    }

    #[tokio::test]
    async fn saves_reads_and_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let tenant_id = Uuid::new_v4();
        let document_id = Uuid::new_v4();

        let stored = store
            .save(SaveRequest {
                tenant_id,
                document_id,
                file_name: "offer.pdf".into(),
                bytes: b"%PDF-1.7".to_vec(),
            })
            .await
            .unwrap();

        assert!(stored
            .path
            .starts_with(&format!("documents/{tenant_id}/")));
        assert!(stored.path.ends_with(&format!("{document_id}_offer.pdf")));
        assert_eq!(stored.size, 8);
        assert_eq!(
            stored.url,
            format!("http://localhost:3000/files/{}", stored.path)
        );
        assert_eq!(store.read(&stored.path).await.unwrap(), b"%PDF-1.7");

        let stat = store.stat(&stored.path).await.unwrap();
        assert!(stat.exists);
        assert_eq!(stat.size, Some(8));

        store.delete(&stored.path).await.unwrap();
        store.delete(&stored.path).await.unwrap();
        assert!(matches!(
            store.read(&stored.path).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(!store.stat(&stored.path).await.unwrap().exists);
    }

    #[tokio::test]
    async fn refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(matches!(
            store.read("../outside").await,
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn dry_run_purge_only_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::write(dir.path().join("tmp").join("scratch.html"), b"<html/>").unwrap();

        // zero hours: everything already written is older than the cutoff
        std::thread::sleep(Duration::from_millis(20));
        let report = store.cleanup_older_than(0, true).await.unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(report.bytes, 7);
        assert!(dir.path().join("tmp").join("scratch.html").exists());

        let report = store.cleanup_older_than(0, false).await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!dir.path().join("tmp").join("scratch.html").exists());

        let report = store.cleanup_older_than(24, false).await.unwrap();
        assert_eq!(report, PurgeReport::default());
    }

    #[tokio::test]
    async fn saves_leave_nothing_behind_and_crashed_writes_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let staging = dir.path().join("tmp");

        let stored = store
            .save(SaveRequest {
                tenant_id: Uuid::new_v4(),
                document_id: Uuid::new_v4(),
                file_name: "offer.pdf".into(),
                bytes: b"%PDF-1.7".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
        let target = dir.path().join("files").join(&stored.path);
        let siblings: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(siblings.len(), 1);

        // what an interrupted save leaves in the staging directory
        let partial = stage(&staging, b"%PDF-1.7 trunc").unwrap();
        let (_, partial_path) = partial.keep().unwrap();
        assert!(partial_path.starts_with(&staging));
        std::thread::sleep(Duration::from_millis(20));

        let report = store.cleanup_older_than(0, false).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes, 14);
        assert!(!partial_path.exists());
        assert_eq!(store.read(&stored.path).await.unwrap(), b"%PDF-1.7");
    }
}
