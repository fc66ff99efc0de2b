use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::{debug, instrument};
use url::Url;
use workcopy_core::{ChunkStream, FileChangesEvent, FileStat, Storage, StorageError};

const CHUNK_SIZE: usize = 64 * 1024;

/// Suffix of the temp files used for atomic writes.
pub(crate) const TEMP_SUFFIX: &str = ".workcopy.tmp";

/// `Storage` over the local filesystem, addressing `file:` URIs.
///
/// Writes go to a sibling temp file that is renamed over the target. Change
/// notifications are published by whoever watches the filesystem (see
/// `StorageWatcher`).
#[derive(Debug)]
pub struct LocalFileStorage {
    case_insensitive: bool,
    changes: broadcast::Sender<FileChangesEvent>,
}

impl LocalFileStorage {
    /// Create a local storage. With `case_insensitive` two paths that differ
    /// only in case have the same identity.
    pub fn new(case_insensitive: bool) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            case_insensitive,
            changes,
        }
    }

    /// Deliver `event` to every change subscriber.
    pub fn publish(&self, event: FileChangesEvent) {
        if self.changes.send(event).is_err() {
            debug!("No subscriber for storage changes");
        }
    }
}

/// Local path of a `file:` resource.
pub(crate) fn file_path(resource: &Url) -> Result<PathBuf, StorageError> {
    if resource.scheme() != "file" {
        return Err(StorageError::InvalidArgument(format!(
            "Local storage only handles file URIs, got {}",
            resource
        )));
    }
    resource
        .to_file_path()
        .map_err(|_| StorageError::InvalidArgument(format!("Not a local path: {}", resource)))
}

pub(crate) fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(TEMP_SUFFIX))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}{}", name, TEMP_SUFFIX))
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> StorageError {
    match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
        _ => StorageError::Io(format!("Failed to {} {}: {}", action, path.display(), e)),
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("create parent directory of", path, e))?;
    }
    Ok(())
}

/// Canonical form of `path`, resolving the parent when the file itself does
/// not exist yet.
async fn canonical(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path).await {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match fs::canonicalize(parent).await {
            Ok(parent) => parent.join(name),
            Err(_) => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

#[async_trait]
impl Storage for LocalFileStorage {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn can_handle(&self, resource: &Url) -> bool {
        resource.scheme() == "file"
    }

    async fn exists(&self, resource: &Url) -> Result<bool, StorageError> {
        let path = file_path(resource)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| io_error("check", &path, e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_stream(&self, resource: &Url) -> Result<ChunkStream, StorageError> {
        let path = file_path(resource)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| io_error("open", &path, e))?;

        let stream = futures::stream::try_unfold((file, path), |(mut file, path)| async move {
            let mut chunk = vec![0u8; CHUNK_SIZE];
            let n = file
                .read(&mut chunk)
                .await
                .map_err(|e| io_error("read", &path, e))?;
            if n == 0 {
                return Ok(None);
            }
            chunk.truncate(n);
            Ok(Some((chunk, (file, path))))
        });
        Ok(stream.boxed())
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write_file(&self, resource: &Url, data: &[u8]) -> Result<FileStat, StorageError> {
        let path = file_path(resource)?;
        ensure_parent(&path).await?;

        // Write atomically via temp file
        let temp_path = temp_path_for(&path);
        fs::write(&temp_path, data)
            .await
            .map_err(|e| io_error("write temp file", &temp_path, e))?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error("rename temp file to", &path, e));
        }

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| io_error("stat", &path, e))?;
        debug!("Wrote {} bytes to {}", data.len(), path.display());

        Ok(FileStat {
            resource: resource.clone(),
            size_bytes: metadata.len(),
            modified_at: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy_file(&self, source: &Url, target: &Url) -> Result<(), StorageError> {
        let from = file_path(source)?;
        let to = file_path(target)?;
        ensure_parent(&to).await?;
        fs::copy(&from, &to)
            .await
            .map_err(|e| io_error("copy", &from, e))?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn move_file(&self, source: &Url, target: &Url) -> Result<(), StorageError> {
        let from = file_path(source)?;
        let to = file_path(target)?;
        ensure_parent(&to).await?;
        fs::rename(&from, &to)
            .await
            .map_err(|e| io_error("move", &from, e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_file(&self, resource: &Url) -> Result<(), StorageError> {
        let path = file_path(resource)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| io_error("delete", &path, e))
    }

    async fn identity_of(&self, resource: &Url) -> Result<Url, StorageError> {
        let path = canonical(&file_path(resource)?).await;
        let mut identity = Url::from_file_path(&path).map_err(|_| {
            StorageError::InvalidArgument(format!("Not an absolute path: {}", path.display()))
        })?;
        if self.case_insensitive {
            let lowered = identity.path().to_lowercase();
            identity.set_path(&lowered);
        }
        Ok(identity)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<FileChangesEvent> {
        self.changes.subscribe()
    }
}
