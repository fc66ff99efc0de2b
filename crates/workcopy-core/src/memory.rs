//! In-process `Storage` and `BackupStore` implementations.
//!
//! Both keep everything in memory and expose counters and failure injection so
//! callers can observe exactly which I/O happened.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::backup::{BackupRecord, BackupStore};
use crate::error::StorageError;
use crate::identity::{WorkingCopyIdentity, UNTITLED_SCHEME};
use crate::storage::{ChunkStream, FileChange, FileChangeType, FileChangesEvent, FileStat, Storage};

const CHUNK_SIZE: usize = 4096;

/// In-memory `Storage`.
///
/// Files are keyed by their identity, so with `case_insensitive` two URIs that
/// differ only in path casing address the same file.
#[derive(Debug)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<String, (Url, Vec<u8>)>>,
    case_insensitive: bool,
    changes: broadcast::Sender<FileChangesEvent>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    moves: AtomicUsize,
    read_delay: Mutex<Option<Duration>>,
    write_delay: Mutex<Option<Duration>>,
    read_failures: Mutex<HashMap<Url, StorageError>>,
    write_failures: Mutex<HashMap<Url, StorageError>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            files: Mutex::new(BTreeMap::new()),
            case_insensitive: false,
            changes,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            moves: AtomicUsize::new(0),
            read_delay: Mutex::new(None),
            write_delay: Mutex::new(None),
            read_failures: Mutex::new(HashMap::new()),
            write_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Storage whose paths compare case-insensitively.
    pub fn case_insensitive() -> Self {
        Self {
            case_insensitive: true,
            ..Self::new()
        }
    }

    fn key(&self, resource: &Url) -> String {
        if self.case_insensitive {
            resource.as_str().to_lowercase()
        } else {
            resource.as_str().to_string()
        }
    }

    /// Put `data` at `resource` without counting a write or notifying.
    pub fn insert(&self, resource: &Url, data: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .insert(self.key(resource), (resource.clone(), data.into()));
    }

    /// Current content of `resource`.
    pub fn content(&self, resource: &Url) -> Option<Vec<u8>> {
        self.files
            .lock()
            .get(&self.key(resource))
            .map(|(_, data)| data.clone())
    }

    /// The URI a file is currently stored under.
    pub fn stored_resource(&self, resource: &Url) -> Option<Url> {
        self.files
            .lock()
            .get(&self.key(resource))
            .map(|(stored, _)| stored.clone())
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    /// Delay every read by `delay`.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    /// Delay every write by `delay`. The content lands once the delay is over.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Make reads of `resource` fail with `err` until cleared.
    pub fn fail_reads(&self, resource: &Url, err: StorageError) {
        self.read_failures.lock().insert(resource.clone(), err);
    }

    /// Make writes to `resource` fail with `err` until cleared.
    pub fn fail_writes(&self, resource: &Url, err: StorageError) {
        self.write_failures.lock().insert(resource.clone(), err);
    }

    pub fn clear_failures(&self) {
        self.read_failures.lock().clear();
        self.write_failures.lock().clear();
    }

    /// Deliver a change event to subscribers, as if made by another process.
    pub fn notify(&self, event: FileChangesEvent) {
        // No subscribers is fine.
        let _ = self.changes.send(event);
    }

    fn check_handled(&self, resource: &Url) -> Result<(), StorageError> {
        if self.can_handle(resource) {
            Ok(())
        } else {
            Err(StorageError::InvalidArgument(format!(
                "memory storage cannot address {}",
                resource
            )))
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn can_handle(&self, resource: &Url) -> bool {
        resource.scheme() != UNTITLED_SCHEME
    }

    async fn exists(&self, resource: &Url) -> Result<bool, StorageError> {
        Ok(self.files.lock().contains_key(&self.key(resource)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_stream(&self, resource: &Url) -> Result<ChunkStream, StorageError> {
        self.check_handled(resource)?;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.read_failures.lock().get(resource) {
            return Err(err.clone());
        }

        let data = self
            .content(resource)
            .ok_or_else(|| StorageError::NotFound(resource.to_string()))?;

        let chunks: Vec<Result<Vec<u8>, StorageError>> = data
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write_file(&self, resource: &Url, data: &[u8]) -> Result<FileStat, StorageError> {
        self.check_handled(resource)?;

        if let Some(err) = self.write_failures.lock().get(resource) {
            return Err(err.clone());
        }

        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        {
            let mut files = self.files.lock();
            let key = self.key(resource);
            // Keep the stored name of an existing file, like a real filesystem.
            let stored = files
                .get(&key)
                .map(|(stored, _)| stored.clone())
                .unwrap_or_else(|| resource.clone());
            files.insert(key, (stored, data.to_vec()));
        }

        debug!("Wrote {} bytes to {}", data.len(), resource);
        Ok(FileStat {
            resource: resource.clone(),
            size_bytes: data.len() as u64,
            modified_at: chrono::Utc::now(),
        })
    }

    async fn copy_file(&self, source: &Url, target: &Url) -> Result<(), StorageError> {
        self.check_handled(target)?;
        let data = self
            .content(source)
            .ok_or_else(|| StorageError::NotFound(source.to_string()))?;
        self.insert(target, data);
        Ok(())
    }

    async fn move_file(&self, source: &Url, target: &Url) -> Result<(), StorageError> {
        self.check_handled(target)?;
        let mut files = self.files.lock();
        let (_, data) = files
            .remove(&self.key(source))
            .ok_or_else(|| StorageError::NotFound(source.to_string()))?;
        files.insert(self.key(target), (target.clone(), data));
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_file(&self, resource: &Url) -> Result<(), StorageError> {
        self.files
            .lock()
            .remove(&self.key(resource))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(resource.to_string()))
    }

    async fn identity_of(&self, resource: &Url) -> Result<Url, StorageError> {
        let mut identity = resource.clone();
        if self.case_insensitive {
            let lowered = resource.path().to_lowercase();
            identity.set_path(&lowered);
        }
        Ok(identity)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<FileChangesEvent> {
        self.changes.subscribe()
    }
}

impl MemoryStorage {
    /// Convenience for tests: report `resource` as updated by someone else.
    pub fn notify_updated(&self, resource: &Url) {
        self.notify(FileChangesEvent::new(vec![FileChange {
            resource: resource.clone(),
            change_type: FileChangeType::Updated,
        }]));
    }
}

/// In-memory `BackupStore`.
#[derive(Debug)]
pub struct MemoryBackupStore {
    records: Mutex<HashMap<WorkingCopyIdentity, BackupRecord>>,
    available: AtomicBool,
    writes: AtomicUsize,
    write_delay: Mutex<Option<Duration>>,
    write_failures: Mutex<HashMap<Url, StorageError>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
            write_delay: Mutex::new(None),
            write_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a record without counting a write.
    pub fn insert(&self, identity: &WorkingCopyIdentity, content: impl Into<Vec<u8>>, content_version: u64) {
        self.records.lock().insert(
            identity.clone(),
            BackupRecord {
                identity: identity.clone(),
                content_version,
                content: content.into(),
                created_at: chrono::Utc::now(),
            },
        );
    }

    pub fn record(&self, identity: &WorkingCopyIdentity) -> Option<BackupRecord> {
        self.records.lock().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Switch the store-level health check.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Make backups of `resource` fail with `err`.
    pub fn fail_writes(&self, resource: &Url, err: StorageError) {
        self.write_failures.lock().insert(resource.clone(), err);
    }
}

impl Default for MemoryBackupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("backup store is offline".to_string()))
        }
    }

    fn backup_version(&self, identity: &WorkingCopyIdentity) -> Option<u64> {
        self.records
            .lock()
            .get(identity)
            .map(|record| record.content_version)
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

        if let Some(err) = self.write_failures.lock().get(&identity.resource) {
            return Err(err.clone());
        }

        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(identity, content.to_vec(), content_version);
        Ok(())
    }

    async fn resolve(
        &self,
        identity: &WorkingCopyIdentity,
    ) -> Result<Option<BackupRecord>, StorageError> {
        Ok(self.record(identity))
    }

    async fn list_backups(&self) -> Result<Vec<WorkingCopyIdentity>, StorageError> {
        let mut identities: Vec<WorkingCopyIdentity> = self.records.lock().keys().cloned().collect();
        identities.sort();
        Ok(identities)
    }

    async fn discard_backup(&self, identity: &WorkingCopyIdentity) -> Result<(), StorageError> {
        self.records.lock().remove(identity);
        Ok(())
    }

    async fn discard_backups(&self, except: &[WorkingCopyIdentity]) -> Result<(), StorageError> {
        self.records
            .lock()
            .retain(|identity, _| except.contains(identity));
        Ok(())
    }
}
