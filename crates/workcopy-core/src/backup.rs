use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::identity::WorkingCopyIdentity;

/// A recovery snapshot of a working copy, keyed by identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub identity: WorkingCopyIdentity,
    /// Content version of the working copy when the snapshot was taken.
    pub content_version: u64,
    pub content: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Per-identity staging area that survives a process restart.
///
/// One record is kept per identity; a newer backup replaces the older one.
/// Writes for different identities never conflict.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Returns the backend identifier (e.g., "file", "memory").
    fn backend_name(&self) -> &'static str;

    /// Store-level health check. A failure here means no backup can be
    /// written at all.
    async fn check_available(&self) -> Result<(), StorageError>;

    /// Content version of the backup for `identity`, if any. Must answer
    /// from memory without I/O.
    fn backup_version(&self, identity: &WorkingCopyIdentity) -> Option<u64>;

    /// Whether a backup exists for `identity`, optionally at exactly
    /// `content_version`.
    fn has_backup_sync(&self, identity: &WorkingCopyIdentity, content_version: Option<u64>) -> bool {
        match self.backup_version(identity) {
            Some(version) => content_version.map_or(true, |v| version == v),
            None => false,
        }
    }

    /// Write a backup. Cancellation is only observed before the write starts;
    /// a write in progress always completes.
    async fn backup(
        &self,
        identity: &WorkingCopyIdentity,
        content: &[u8],
        content_version: u64,
        token: &CancellationToken,
    ) -> Result<(), StorageError>;

    /// Load the backup for `identity`, if any.
    async fn resolve(
        &self,
        identity: &WorkingCopyIdentity,
    ) -> Result<Option<BackupRecord>, StorageError>;

    /// Identities that currently have a backup.
    async fn list_backups(&self) -> Result<Vec<WorkingCopyIdentity>, StorageError>;

    async fn discard_backup(&self, identity: &WorkingCopyIdentity) -> Result<(), StorageError>;

    /// Discard every backup except those of `except`.
    async fn discard_backups(&self, except: &[WorkingCopyIdentity]) -> Result<(), StorageError>;
}
