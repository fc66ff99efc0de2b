//! A single editable document and its dirty/version state.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use workcopy_core::{
    BackupRecord, BackupStore, Emitter, FileStat, Storage, WorkingCopyError, WorkingCopyIdentity,
};

/// Lifecycle of a working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unresolved,
    Resolving,
    Resolved,
    Disposed,
}

/// What triggered a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveReason {
    #[default]
    Explicit,
    Auto,
    FocusChange,
    WindowChange,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Use these contents instead of reading storage. The copy becomes dirty.
    pub contents: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Write even when the copy is not dirty.
    pub force: bool,
    pub reason: SaveReason,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RevertOptions {
    /// Only reset the dirty state to the last known saved content, no I/O.
    pub soft: bool,
}

/// Fired after a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveEvent {
    pub identity: WorkingCopyIdentity,
    pub reason: SaveReason,
    /// The content version that was written.
    pub content_version: u64,
}

#[derive(Debug)]
struct CopyState {
    model_state: ModelState,
    content: Vec<u8>,
    saved_content: Vec<u8>,
    dirty: bool,
    version: u64,
    saved_version: u64,
    orphaned: bool,
    last_stat: Option<FileStat>,
}

/// An editable in-memory document bound to one identity.
///
/// Content edits bump a monotonically increasing content version. The dirty
/// flag is only cleared by a successful save or a revert.
pub struct WorkingCopy {
    identity: WorkingCopyIdentity,
    name: String,
    associated_path: Option<Url>,
    storage: Arc<dyn Storage>,
    backups: Arc<dyn BackupStore>,
    state: Mutex<CopyState>,
    save_lock: tokio::sync::Mutex<()>,
    on_did_resolve: Emitter<WorkingCopyIdentity>,
    on_did_change_content: Emitter<WorkingCopyIdentity>,
    on_did_change_dirty: Emitter<WorkingCopyIdentity>,
    on_did_save: Emitter<SaveEvent>,
    on_did_save_error: Emitter<WorkingCopyIdentity>,
    on_did_revert: Emitter<WorkingCopyIdentity>,
    on_did_dispose: Emitter<WorkingCopyIdentity>,
}

impl WorkingCopy {
    /// A copy of a persisted resource. Nothing is read until `resolve`.
    pub fn new(
        identity: WorkingCopyIdentity,
        storage: Arc<dyn Storage>,
        backups: Arc<dyn BackupStore>,
    ) -> Arc<Self> {
        let name = identity.name();
        Arc::new(Self::build(identity, name, None, Vec::new(), storage, backups))
    }

    /// A never persisted copy. Non-empty initial content makes it dirty.
    pub fn new_untitled(
        identity: WorkingCopyIdentity,
        associated_path: Option<Url>,
        initial_value: Option<Vec<u8>>,
        storage: Arc<dyn Storage>,
        backups: Arc<dyn BackupStore>,
    ) -> Arc<Self> {
        let name = match &associated_path {
            Some(path) => WorkingCopyIdentity::new(identity.type_id.clone(), path.clone()).name(),
            None => identity.name(),
        };
        let copy = Self::build(
            identity,
            name,
            associated_path,
            initial_value.unwrap_or_default(),
            storage,
            backups,
        );
        {
            let mut state = copy.state.lock();
            state.dirty = !state.content.is_empty() || copy.associated_path.is_some();
        }
        Arc::new(copy)
    }

    fn build(
        identity: WorkingCopyIdentity,
        name: String,
        associated_path: Option<Url>,
        content: Vec<u8>,
        storage: Arc<dyn Storage>,
        backups: Arc<dyn BackupStore>,
    ) -> Self {
        Self {
            identity,
            name,
            associated_path,
            storage,
            backups,
            state: Mutex::new(CopyState {
                model_state: ModelState::Unresolved,
                content,
                saved_content: Vec::new(),
                dirty: false,
                version: 0,
                saved_version: 0,
                orphaned: false,
                last_stat: None,
            }),
            save_lock: tokio::sync::Mutex::new(()),
            on_did_resolve: Emitter::new(),
            on_did_change_content: Emitter::new(),
            on_did_change_dirty: Emitter::new(),
            on_did_save: Emitter::new(),
            on_did_save_error: Emitter::new(),
            on_did_revert: Emitter::new(),
            on_did_dispose: Emitter::new(),
        }
    }

    pub fn identity(&self) -> &WorkingCopyIdentity {
        &self.identity
    }

    pub fn resource(&self) -> &Url {
        &self.identity.resource
    }

    pub fn type_id(&self) -> &str {
        &self.identity.type_id
    }

    /// Name shown to the user.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_untitled(&self) -> bool {
        self.identity.is_untitled()
    }

    /// Where an untitled copy wants to be saved, if it was created for a path.
    pub fn associated_path(&self) -> Option<&Url> {
        self.associated_path.as_ref()
    }

    pub fn model_state(&self) -> ModelState {
        self.state.lock().model_state
    }

    pub fn is_resolved(&self) -> bool {
        self.model_state() == ModelState::Resolved
    }

    pub fn is_disposed(&self) -> bool {
        self.model_state() == ModelState::Disposed
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Whether the backing resource was found missing.
    pub fn is_orphaned(&self) -> bool {
        self.state.lock().orphaned
    }

    pub fn content_version(&self) -> u64 {
        self.state.lock().version
    }

    /// Content version as of the last save or revert.
    pub fn saved_version(&self) -> u64 {
        self.state.lock().saved_version
    }

    pub fn content(&self) -> Vec<u8> {
        self.state.lock().content.clone()
    }

    pub fn last_stat(&self) -> Option<FileStat> {
        self.state.lock().last_stat.clone()
    }

    pub fn on_did_resolve(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_resolve
    }

    pub fn on_did_change_content(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_change_content
    }

    pub fn on_did_change_dirty(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_change_dirty
    }

    pub fn on_did_save(&self) -> &Emitter<SaveEvent> {
        &self.on_did_save
    }

    pub fn on_did_save_error(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_save_error
    }

    pub fn on_did_revert(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_revert
    }

    pub fn on_did_dispose(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_dispose
    }

    fn disposed_error(&self) -> WorkingCopyError {
        WorkingCopyError::Disposed {
            resource: self.resource().clone(),
        }
    }

    /// Load the copy.
    ///
    /// The first resolve restores a backup if one exists. A dirty copy is
    /// never overwritten from storage.
    #[instrument(skip(self, options), level = "debug", fields(identity = %self.identity))]
    pub async fn resolve(&self, options: ResolveOptions) -> Result<(), WorkingCopyError> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }

        if let Some(contents) = options.contents {
            self.apply_contents(contents);
            return Ok(());
        }

        let first = self.model_state() == ModelState::Unresolved;
        if first {
            match self.backups.resolve(&self.identity).await {
                Ok(Some(record)) => return self.resolve_from_backup(record).await,
                Ok(None) => {}
                Err(e) => warn!(
                    "[working copy] Failed to restore backup of {}: {}",
                    self.identity, e
                ),
            }
        }

        if self.is_untitled() {
            self.mark_resolved();
            self.on_did_resolve.fire(&self.identity);
            return Ok(());
        }

        if self.is_dirty() {
            debug!(
                "[working copy] Ignoring resolve of {} because it is dirty",
                self.identity
            );
            self.mark_resolved();
            return Ok(());
        }

        self.resolve_from_storage(first).await
    }

    fn mark_resolved(&self) {
        let mut state = self.state.lock();
        if matches!(
            state.model_state,
            ModelState::Unresolved | ModelState::Resolving
        ) {
            state.model_state = ModelState::Resolved;
        }
    }

    fn apply_contents(&self, contents: Vec<u8>) {
        let was_dirty = {
            let mut state = self.state.lock();
            let was_dirty = state.dirty;
            state.content = contents;
            state.version += 1;
            state.dirty = true;
            if state.model_state != ModelState::Disposed {
                state.model_state = ModelState::Resolved;
            }
            was_dirty
        };

        self.on_did_change_content.fire(&self.identity);
        if !was_dirty {
            self.on_did_change_dirty.fire(&self.identity);
        }
        self.on_did_resolve.fire(&self.identity);
    }

    async fn resolve_from_backup(&self, record: BackupRecord) -> Result<(), WorkingCopyError> {
        debug!(
            "[working copy] Restoring {} from backup (version {})",
            self.identity, record.content_version
        );

        let mut orphaned = false;
        let saved_content = if self.is_untitled() {
            Vec::new()
        } else {
            match self.storage.read_file(self.resource()).await {
                Ok(data) => data,
                Err(e) if e.is_not_found() => {
                    orphaned = true;
                    Vec::new()
                }
                Err(e) => {
                    warn!(
                        "[working copy] Failed to read saved content of {}: {}",
                        self.identity, e
                    );
                    Vec::new()
                }
            }
        };

        let was_dirty = {
            let mut state = self.state.lock();
            if state.model_state == ModelState::Disposed {
                return Err(self.disposed_error());
            }
            let was_dirty = state.dirty;
            state.content = record.content;
            state.version = (state.version + 1).max(record.content_version);
            state.saved_content = saved_content;
            state.orphaned = orphaned;
            state.dirty = true;
            state.model_state = ModelState::Resolved;
            was_dirty
        };

        self.on_did_change_content.fire(&self.identity);
        if !was_dirty {
            self.on_did_change_dirty.fire(&self.identity);
        }
        self.on_did_resolve.fire(&self.identity);
        Ok(())
    }

    async fn resolve_from_storage(&self, first: bool) -> Result<(), WorkingCopyError> {
        let version_before = {
            let mut state = self.state.lock();
            if first {
                state.model_state = ModelState::Resolving;
            }
            state.version
        };

        let data = match self.storage.read_file(self.resource()).await {
            Ok(data) => data,
            Err(e) => {
                let mut state = self.state.lock();
                if state.model_state == ModelState::Resolving {
                    state.model_state = ModelState::Unresolved;
                }
                return Err(WorkingCopyError::resolution(self.resource(), e));
            }
        };

        let changed = {
            let mut state = self.state.lock();
            if state.model_state == ModelState::Disposed {
                return Err(self.disposed_error());
            }
            if state.version != version_before || state.dirty {
                debug!(
                    "[working copy] Discarding stale read of {}, content changed meanwhile",
                    self.identity
                );
                state.model_state = ModelState::Resolved;
                return Ok(());
            }

            let changed = state.content != data;
            if changed {
                state.content = data.clone();
                state.version += 1;
            }
            state.saved_content = data;
            state.saved_version = state.version;
            state.orphaned = false;
            state.model_state = ModelState::Resolved;
            changed
        };

        if changed {
            self.on_did_change_content.fire(&self.identity);
        }
        self.on_did_resolve.fire(&self.identity);
        Ok(())
    }

    /// Replace the content. Any change makes the copy dirty.
    pub fn set_content(&self, content: impl Into<Vec<u8>>) -> Result<(), WorkingCopyError> {
        let content = content.into();
        let (was_dirty, is_dirty) = {
            let mut state = self.state.lock();
            if state.model_state == ModelState::Disposed {
                return Err(self.disposed_error());
            }
            if state.content == content {
                return Ok(());
            }
            let was_dirty = state.dirty;
            state.content = content;
            state.version += 1;
            state.dirty = if self.is_untitled() {
                !state.content.is_empty() || self.associated_path.is_some()
            } else {
                true
            };
            (was_dirty, state.dirty)
        };

        self.on_did_change_content.fire(&self.identity);
        if was_dirty != is_dirty {
            self.on_did_change_dirty.fire(&self.identity);
        }
        Ok(())
    }

    /// Flag the copy dirty without changing its content.
    pub fn mark_dirty(&self) {
        let changed = {
            let mut state = self.state.lock();
            if state.dirty || state.model_state == ModelState::Disposed {
                false
            } else {
                state.dirty = true;
                true
            }
        };
        if changed {
            self.on_did_change_dirty.fire(&self.identity);
        }
    }

    /// Snapshot the current content for a backup.
    ///
    /// Returns `None` when `token` is cancelled before the snapshot is taken.
    pub async fn snapshot(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, WorkingCopyError> {
        tokio::task::yield_now().await;
        if token.is_cancelled() {
            return Ok(None);
        }
        let state = self.state.lock();
        if state.model_state == ModelState::Disposed {
            return Err(self.disposed_error());
        }
        Ok(Some(state.content.clone()))
    }

    /// Persist the content.
    ///
    /// Returns `Ok(false)` when nothing was written: untitled copies have no
    /// location and clean copies are skipped unless `force` is set.
    #[instrument(skip(self, options), level = "debug", fields(identity = %self.identity))]
    pub async fn save(&self, options: SaveOptions) -> Result<bool, WorkingCopyError> {
        if self.is_disposed() {
            return Ok(false);
        }
        if self.is_untitled() {
            debug!(
                "[working copy] Not saving untitled {}, it needs a target",
                self.identity
            );
            return Ok(false);
        }

        let _guard = self.save_lock.lock().await;

        let (content, version) = {
            let state = self.state.lock();
            if !state.dirty && !options.force {
                return Ok(false);
            }
            (state.content.clone(), state.version)
        };

        match self.storage.write_file(self.resource(), &content).await {
            Ok(stat) => {
                let became_clean = {
                    let mut state = self.state.lock();
                    state.saved_content = content;
                    state.saved_version = version;
                    state.last_stat = Some(stat);
                    state.orphaned = false;
                    if state.version == version && state.dirty {
                        state.dirty = false;
                        true
                    } else {
                        false
                    }
                };

                debug!(
                    "[working copy] Saved {} at version {} ({:?})",
                    self.identity, version, options.reason
                );
                self.on_did_save.fire(&SaveEvent {
                    identity: self.identity.clone(),
                    reason: options.reason,
                    content_version: version,
                });
                if became_clean {
                    self.on_did_change_dirty.fire(&self.identity);
                }
                Ok(true)
            }
            Err(e) => {
                let err = WorkingCopyError::save(self.resource(), e);
                warn!("[working copy] {}", err);
                self.on_did_save_error.fire(&self.identity);
                Err(err)
            }
        }
    }

    /// Discard unsaved changes.
    ///
    /// A soft revert resets to the last known saved content. Otherwise the
    /// saved content is read again first; a missing resource is tolerated.
    /// Reverting an untitled copy disposes it.
    #[instrument(skip(self, options), level = "debug", fields(identity = %self.identity))]
    pub async fn revert(&self, options: RevertOptions) -> Result<(), WorkingCopyError> {
        if self.is_disposed() {
            return Ok(());
        }

        if self.is_untitled() {
            let was_dirty = {
                let mut state = self.state.lock();
                let was_dirty = state.dirty;
                state.dirty = false;
                state.content.clear();
                state.version += 1;
                was_dirty
            };
            if was_dirty {
                self.on_did_change_dirty.fire(&self.identity);
            }
            self.on_did_revert.fire(&self.identity);
            self.dispose();
            return Ok(());
        }

        let fresh = if options.soft {
            None
        } else {
            match self.storage.read_file(self.resource()).await {
                Ok(data) => Some(data),
                Err(e) if e.is_not_found() => {
                    debug!(
                        "[working copy] Reverting {} whose resource is gone",
                        self.identity
                    );
                    self.state.lock().orphaned = true;
                    None
                }
                Err(e) => return Err(WorkingCopyError::resolution(self.resource(), e)),
            }
        };

        let (changed, was_dirty) = {
            let mut state = self.state.lock();
            if let Some(data) = fresh {
                state.saved_content = data;
            }
            let changed = state.content != state.saved_content;
            if changed {
                state.content = state.saved_content.clone();
                state.version += 1;
            }
            state.saved_version = state.version;
            let was_dirty = state.dirty;
            state.dirty = false;
            (changed, was_dirty)
        };

        if changed {
            self.on_did_change_content.fire(&self.identity);
        }
        if was_dirty {
            self.on_did_change_dirty.fire(&self.identity);
        }
        self.on_did_revert.fire(&self.identity);
        Ok(())
    }

    /// Release the copy. Idempotent; listeners are dropped after the dispose event.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if state.model_state == ModelState::Disposed {
                return;
            }
            state.model_state = ModelState::Disposed;
        }

        debug!("[working copy] Disposed {}", self.identity);
        self.on_did_dispose.fire(&self.identity);

        self.on_did_resolve.clear();
        self.on_did_change_content.clear();
        self.on_did_change_dirty.clear();
        self.on_did_save.clear();
        self.on_did_save_error.clear();
        self.on_did_revert.clear();
        self.on_did_dispose.clear();
    }
}

impl fmt::Debug for WorkingCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkingCopy")
            .field("identity", &self.identity)
            .field("model_state", &state.model_state)
            .field("dirty", &state.dirty)
            .field("version", &state.version)
            .finish_non_exhaustive()
    }
}
