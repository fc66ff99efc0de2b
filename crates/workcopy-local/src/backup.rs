use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use workcopy_core::{BackupRecord, BackupStore, StorageError, WorkingCopyIdentity};

/// Metadata persisted next to each backup's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupMeta {
    identity: WorkingCopyIdentity,
    content_version: u64,
    created_at: DateTime<Utc>,
    size_bytes: u64,
}

/// `BackupStore` that keeps one `<hash>.bin` / `<hash>.json` pair per identity
/// in a directory.
///
/// The hash is the SHA256 of the identity, so any resource maps to a safe file
/// name. Metadata is written after the content and acts as the commit marker.
/// Known versions are cached in memory for `backup_version`.
#[derive(Debug)]
pub struct FileBackupStore {
    root: PathBuf,
    versions: DashMap<WorkingCopyIdentity, u64>,
}

impl FileBackupStore {
    /// Open the store at `root`, creating it if needed and indexing the
    /// backups left by a previous session.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to create backup directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let store = Self {
            root,
            versions: DashMap::new(),
        };
        store.load_index().await?;
        info!(
            "Opened backup store at {} with {} backup(s)",
            store.root.display(),
            store.versions.len()
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load_index(&self) -> Result<(), StorageError> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| {
            StorageError::Io(format!("Failed to list {}: {}", self.root.display(), e))
        })?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to list {}: {}", self.root.display(), e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let meta = match self.read_meta(&path).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Skipping unreadable backup metadata: {}", e);
                    continue;
                }
            };
            if fs::try_exists(path.with_extension("bin")).await.unwrap_or(false) {
                self.versions.insert(meta.identity, meta.content_version);
            } else {
                warn!("Backup of {} has no content, ignoring", meta.identity);
            }
        }
        Ok(())
    }

    fn key(identity: &WorkingCopyIdentity) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identity.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn meta_path(&self, identity: &WorkingCopyIdentity) -> PathBuf {
        self.root.join(format!("{}.json", Self::key(identity)))
    }

    fn content_path(&self, identity: &WorkingCopyIdentity) -> PathBuf {
        self.root.join(format!("{}.bin", Self::key(identity)))
    }

    async fn read_meta(&self, path: &Path) -> Result<BackupMeta, StorageError> {
        let json = fs::read(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
            _ => StorageError::Io(format!("Failed to read {}: {}", path.display(), e)),
        })?;
        serde_json::from_slice(&json).map_err(|e| {
            StorageError::Serialization(format!("Invalid backup metadata {}: {}", path.display(), e))
        })
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);
        fs::write(&temp_path, data).await.map_err(|e| {
            StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, path).await.map_err(|e| {
            StorageError::Io(format!("Failed to rename {}: {}", path.display(), e))
        })
    }

    async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl BackupStore for FileBackupStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn check_available(&self) -> Result<(), StorageError> {
        match fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(StorageError::Unavailable(format!(
                "{}: {}",
                self.root.display(),
                e
            ))),
        }
    }

    fn backup_version(&self, identity: &WorkingCopyIdentity) -> Option<u64> {
        self.versions.get(identity).map(|version| *version)
    }

    #[instrument(skip(self, content, token), level = "debug", fields(data_len = content.len()))]
    async fn backup(
        &self,
        identity: &WorkingCopyIdentity,
        content: &[u8],
        content_version: u64,
        token: &CancellationToken,
    ) -> Result<(), StorageError> {
        if token.is_cancelled() {
            return Err(StorageError::Cancelled(identity.to_string()));
        }

        let meta = BackupMeta {
            identity: identity.clone(),
            content_version,
            created_at: Utc::now(),
            size_bytes: content.len() as u64,
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        Self::write_atomic(&self.content_path(identity), content).await?;
        Self::write_atomic(&self.meta_path(identity), &json).await?;
        self.versions.insert(identity.clone(), content_version);

        debug!("Backed up {} (version {})", identity, content_version);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn resolve(
        &self,
        identity: &WorkingCopyIdentity,
    ) -> Result<Option<BackupRecord>, StorageError> {
        let meta = match self.read_meta(&self.meta_path(identity)).await {
            Ok(meta) => meta,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let content_path = self.content_path(identity);
        let content = match fs::read(&content_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read {}: {}",
                    content_path.display(),
                    e
                )))
            }
        };

        Ok(Some(BackupRecord {
            identity: meta.identity,
            content_version: meta.content_version,
            content,
            created_at: meta.created_at,
        }))
    }

    async fn list_backups(&self) -> Result<Vec<WorkingCopyIdentity>, StorageError> {
        let mut identities: Vec<WorkingCopyIdentity> =
            self.versions.iter().map(|entry| entry.key().clone()).collect();
        identities.sort();
        Ok(identities)
    }

    #[instrument(skip(self), level = "debug")]
    async fn discard_backup(&self, identity: &WorkingCopyIdentity) -> Result<(), StorageError> {
        // Metadata first so a partial discard never leaves a committed backup
        // without content.
        Self::remove_if_exists(&self.meta_path(identity)).await?;
        Self::remove_if_exists(&self.content_path(identity)).await?;
        self.versions.remove(identity);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn discard_backups(&self, except: &[WorkingCopyIdentity]) -> Result<(), StorageError> {
        let discard: Vec<WorkingCopyIdentity> = self
            .versions
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|identity| !except.contains(identity))
            .collect();

        for identity in &discard {
            self.discard_backup(identity).await?;
        }
        debug!("Discarded {} backup(s), kept {}", discard.len(), except.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use url::Url;

    fn text(s: &str) -> WorkingCopyIdentity {
        WorkingCopyIdentity::new("text", Url::parse(s).unwrap())
    }

    #[tokio::test]
    async fn test_backups_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let a = text("file:///work/a.txt");
        let untitled = text("untitled:Untitled-1");
        {
            let store = FileBackupStore::open(dir.path()).await.unwrap();
            let token = CancellationToken::new();
            store.backup(&a, b"a'", 3, &token).await.unwrap();
            store.backup(&untitled, b"draft", 1, &token).await.unwrap();
        }

        let store = FileBackupStore::open(dir.path()).await.unwrap();

        assert_eq!(store.list_backups().await.unwrap(), vec![a.clone(), untitled.clone()]);
        assert!(store.has_backup_sync(&a, Some(3)));
        assert!(!store.has_backup_sync(&a, Some(2)));
        let record = store.resolve(&untitled).await.unwrap().unwrap();
        assert_eq!(record.content, b"draft".to_vec());
        assert_eq!(record.identity, untitled);
    }

    #[tokio::test]
    async fn test_newer_backup_replaces_older() {
        let dir = TempDir::new().unwrap();
        let store = FileBackupStore::open(dir.path()).await.unwrap();
        let a = text("file:///work/a.txt");
        let token = CancellationToken::new();

        store.backup(&a, b"one", 1, &token).await.unwrap();
        store.backup(&a, b"two", 2, &token).await.unwrap();

        let record = store.resolve(&a).await.unwrap().unwrap();
        assert_eq!(record.content, b"two".to_vec());
        assert_eq!(record.content_version, 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_backup_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = FileBackupStore::open(dir.path()).await.unwrap();
        let a = text("file:///work/a.txt");
        let token = CancellationToken::new();
        token.cancel();

        let result = store.backup(&a, b"x", 1, &token).await;

        assert!(matches!(result, Err(StorageError::Cancelled(_))));
        assert!(!store.has_backup_sync(&a, None));
        assert_eq!(store.resolve(&a).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_discard_backups_keeps_exceptions() {
        let dir = TempDir::new().unwrap();
        let store = FileBackupStore::open(dir.path()).await.unwrap();
        let token = CancellationToken::new();
        let a = text("file:///work/a.txt");
        let b = text("file:///work/b.txt");
        let c = text("file:///work/c.txt");
        for identity in [&a, &b, &c] {
            store.backup(identity, b"x", 1, &token).await.unwrap();
        }

        store.discard_backup(&a).await.unwrap();
        store.discard_backups(&[c.clone()]).await.unwrap();

        assert_eq!(store.list_backups().await.unwrap(), vec![c]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
        // Discarding twice is fine.
        store.discard_backup(&a).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("broken.bin"), b"data").unwrap();

        let store = FileBackupStore::open(dir.path()).await.unwrap();

        assert!(store.list_backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_directory_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("backups");
        let store = FileBackupStore::open(&root).await.unwrap();
        assert_eq!(store.root(), root.as_path());
        store.check_available().await.unwrap();

        std::fs::remove_dir_all(&root).unwrap();

        let err = store.check_available().await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
