use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use url::Url;

use crate::error::StorageError;

/// Stream of content chunks as produced by [`Storage::read_stream`].
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, StorageError>>;

/// Metadata returned after a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub resource: Url,
    pub size_bytes: u64,
    pub modified_at: chrono::DateTime<chrono::Utc>,
}

/// Kinds of change reported by the storage change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeType {
    Added,
    Updated,
    Deleted,
}

/// A single change to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub resource: Url,
    pub change_type: FileChangeType,
}

/// A batch of changes delivered together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangesEvent {
    pub changes: Vec<FileChange>,
}

impl FileChangesEvent {
    pub fn new(changes: Vec<FileChange>) -> Self {
        Self { changes }
    }

    pub fn single(resource: Url, change_type: FileChangeType) -> Self {
        Self {
            changes: vec![FileChange {
                resource,
                change_type,
            }],
        }
    }

    /// Whether `resource` is affected by a change of one of `types`.
    ///
    /// A change to a folder affects everything below it, so matching is by
    /// path prefix on segment boundaries.
    pub fn contains(&self, resource: &Url, types: &[FileChangeType]) -> bool {
        self.changes.iter().any(|change| {
            (types.is_empty() || types.contains(&change.change_type))
                && is_equal_or_parent(resource, &change.resource)
        })
    }
}

/// `candidate` equals `parent` or lives below it.
pub fn is_equal_or_parent(candidate: &Url, parent: &Url) -> bool {
    if candidate.scheme() != parent.scheme() || candidate.host_str() != parent.host_str() {
        return false;
    }
    let child = candidate.path();
    let base = parent.path().trim_end_matches('/');
    child == parent.path()
        || child == base
        || (child.starts_with(base) && child[base.len()..].starts_with('/'))
}

/// Byte-level access to persisted resources.
///
/// Implementations decide which URI schemes they address (`can_handle`). Every
/// method other than `subscribe_changes` is a suspension point.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the backend identifier (e.g., "local", "memory").
    fn backend_name(&self) -> &'static str;

    /// Whether this backend can address `resource` at all.
    fn can_handle(&self, resource: &Url) -> bool;

    async fn exists(&self, resource: &Url) -> Result<bool, StorageError>;

    /// Stream the content of `resource` in chunks.
    async fn read_stream(&self, resource: &Url) -> Result<ChunkStream, StorageError>;

    /// Read the whole content of `resource`.
    async fn read_file(&self, resource: &Url) -> Result<Vec<u8>, StorageError> {
        let chunks: Vec<Vec<u8>> = self.read_stream(resource).await?.try_collect().await?;
        Ok(chunks.concat())
    }

    /// Create or replace `resource` with `data`.
    async fn write_file(&self, resource: &Url, data: &[u8]) -> Result<FileStat, StorageError>;

    async fn copy_file(&self, source: &Url, target: &Url) -> Result<(), StorageError>;

    async fn move_file(&self, source: &Url, target: &Url) -> Result<(), StorageError>;

    async fn delete_file(&self, resource: &Url) -> Result<(), StorageError>;

    /// The physical identity behind `resource`.
    ///
    /// Two URIs that map to the same identity address the same stored object,
    /// e.g. differently cased paths on a case-insensitive mount.
    async fn identity_of(&self, resource: &Url) -> Result<Url, StorageError>;

    /// Subscribe to change notifications. Receivers that lag lose events.
    fn subscribe_changes(&self) -> broadcast::Receiver<FileChangesEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_contains_exact_and_prefix() {
        let event = FileChangesEvent::new(vec![
            FileChange {
                resource: url("file:///work/src"),
                change_type: FileChangeType::Updated,
            },
            FileChange {
                resource: url("file:///work/readme.md"),
                change_type: FileChangeType::Deleted,
            },
        ]);

        assert!(event.contains(&url("file:///work/src/main.rs"), &[FileChangeType::Updated]));
        assert!(event.contains(&url("file:///work/src"), &[]));
        assert!(!event.contains(&url("file:///work/srcfoo/x"), &[FileChangeType::Updated]));
        assert!(!event.contains(&url("file:///work/readme.md"), &[FileChangeType::Updated]));
        assert!(event.contains(&url("file:///work/readme.md"), &[FileChangeType::Deleted]));
    }

    #[test]
    fn test_scheme_mismatch_never_matches() {
        let event = FileChangesEvent::single(url("file:///a"), FileChangeType::Added);
        assert!(!event.contains(&url("untitled:a"), &[]));
    }
}
