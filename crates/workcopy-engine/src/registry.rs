//! The set of live working copies, keyed by identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use workcopy_core::{
    is_equal_or_parent, BackupStore, Emitter, FileChangeType, FileChangesEvent, Storage,
    Subscription, WorkingCopyError, WorkingCopyIdentity, UNTITLED_SCHEME,
};

use crate::queue::{PendingResolution, ReloadQueue, ResolutionQueue};
use crate::working_copy::{ResolveOptions, SaveEvent, WorkingCopy};

/// How an already known working copy is reloaded by `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    /// The caller waits for the reload.
    Sync,
    /// The reload runs in the background; the caller gets the copy right away.
    Async,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryResolveOptions {
    /// Reload an already known copy. New copies are always loaded.
    pub reload: Option<ReloadMode>,
    /// Contents to apply instead of reading storage. Makes the copy dirty.
    pub contents: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateUntitledOptions {
    /// Where the document should be saved by default.
    pub associated_path: Option<Url>,
    pub initial_value: Option<Vec<u8>>,
}

struct Tracked {
    copy: Arc<WorkingCopy>,
    listeners: Vec<Subscription>,
}

enum Step {
    Ready(Arc<WorkingCopy>),
    Wait {
        copy: Arc<WorkingCopy>,
        pending: PendingResolution,
    },
}

/// Keeps storage change events from reloading copies while held.
#[must_use = "dropping the guard resumes reloads"]
#[derive(Debug)]
pub struct SuspendGuard {
    counter: Arc<AtomicUsize>,
}

impl SuspendGuard {
    pub fn resume(self) {}
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of working copies of every type.
///
/// Holds at most one live copy per identity and at most one pending
/// resolution per identity. Concurrent `resolve` calls for the same identity
/// share a single load.
pub struct WorkingCopyRegistry {
    me: Weak<Self>,
    storage: Arc<dyn Storage>,
    backups: Arc<dyn BackupStore>,
    copies: Mutex<HashMap<WorkingCopyIdentity, Tracked>>,
    resolutions: ResolutionQueue,
    reloads: ReloadQueue,
    decide: Mutex<()>,
    untitled_counter: AtomicU64,
    suspended: Arc<AtomicUsize>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    on_did_create: Emitter<WorkingCopyIdentity>,
    on_did_resolve: Emitter<WorkingCopyIdentity>,
    on_did_change_dirty: Emitter<WorkingCopyIdentity>,
    on_did_change_content: Emitter<WorkingCopyIdentity>,
    on_did_save: Emitter<SaveEvent>,
    on_did_save_error: Emitter<WorkingCopyIdentity>,
    on_did_revert: Emitter<WorkingCopyIdentity>,
    on_did_dispose: Emitter<WorkingCopyIdentity>,
}

impl WorkingCopyRegistry {
    pub fn new(storage: Arc<dyn Storage>, backups: Arc<dyn BackupStore>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            storage,
            backups,
            copies: Mutex::new(HashMap::new()),
            resolutions: ResolutionQueue::new(),
            reloads: ReloadQueue::new(),
            decide: Mutex::new(()),
            untitled_counter: AtomicU64::new(0),
            suspended: Arc::new(AtomicUsize::new(0)),
            watcher: Mutex::new(None),
            on_did_create: Emitter::new(),
            on_did_resolve: Emitter::new(),
            on_did_change_dirty: Emitter::new(),
            on_did_change_content: Emitter::new(),
            on_did_save: Emitter::new(),
            on_did_save_error: Emitter::new(),
            on_did_revert: Emitter::new(),
            on_did_dispose: Emitter::new(),
        })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn on_did_create(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_create
    }

    pub fn on_did_resolve(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_resolve
    }

    pub fn on_did_change_dirty(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_change_dirty
    }

    pub fn on_did_change_content(&self) -> &Emitter<WorkingCopyIdentity> {
        &self.on_did_change_content
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

    pub fn get(&self, identity: &WorkingCopyIdentity) -> Option<Arc<WorkingCopy>> {
        self.copies
            .lock()
            .get(identity)
            .map(|tracked| tracked.copy.clone())
    }

    /// All live copies, ordered by identity.
    pub fn working_copies(&self) -> Vec<Arc<WorkingCopy>> {
        let mut copies: Vec<Arc<WorkingCopy>> = self
            .copies
            .lock()
            .values()
            .map(|tracked| tracked.copy.clone())
            .collect();
        copies.sort_by(|a, b| a.identity().cmp(b.identity()));
        copies
    }

    /// Live copies with unsaved changes, ordered by identity.
    pub fn modified_working_copies(&self) -> Vec<Arc<WorkingCopy>> {
        self.working_copies()
            .into_iter()
            .filter(|copy| copy.is_dirty())
            .collect()
    }

    pub fn modified_count(&self) -> usize {
        self.copies
            .lock()
            .values()
            .filter(|tracked| tracked.copy.is_dirty())
            .count()
    }

    pub fn len(&self) -> usize {
        self.copies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.lock().is_empty()
    }

    pub fn has_pending_resolve(&self, identity: &WorkingCopyIdentity) -> bool {
        self.resolutions.is_pending(identity)
    }

    /// Get or load the working copy for `identity`.
    ///
    /// Joins a resolution already in flight for the same identity. Failed
    /// loads of a new copy leave nothing behind, so a later call retries.
    #[instrument(skip(self, options), level = "debug", fields(identity = %identity))]
    pub async fn resolve(
        &self,
        identity: &WorkingCopyIdentity,
        options: RegistryResolveOptions,
    ) -> Result<Arc<WorkingCopy>, WorkingCopyError> {
        loop {
            if let Some(pending) = self.resolutions.join(identity) {
                // Errors belong to the caller that started the resolution.
                let _ = pending.wait().await;
                continue;
            }

            let step = {
                let _decide = self.decide.lock();
                if self.resolutions.is_pending(identity) {
                    continue;
                }
                self.begin_resolve(identity, &options)
            };

            return match step {
                Step::Ready(copy) => Ok(copy),
                Step::Wait { copy, pending } => {
                    pending.wait().await?;
                    Ok(copy)
                }
            };
        }
    }

    fn begin_resolve(
        &self,
        identity: &WorkingCopyIdentity,
        options: &RegistryResolveOptions,
    ) -> Step {
        let resolve_options = ResolveOptions {
            contents: options.contents.clone(),
        };

        if let Some(copy) = self.get(identity) {
            if options.contents.is_none() && options.reload.is_none() {
                return Step::Ready(copy);
            }

            let pending = self.resolutions.track(
                identity.clone(),
                self.resolve_task(copy.clone(), resolve_options, false),
            );

            if options.contents.is_none() && options.reload == Some(ReloadMode::Async) {
                let identity = identity.clone();
                tokio::spawn(async move {
                    if let Err(e) = pending.wait().await {
                        warn!("[working copy] Background reload of {} failed: {}", identity, e);
                    }
                });
                return Step::Ready(copy);
            }

            return Step::Wait { copy, pending };
        }

        let copy = if identity.is_untitled() {
            WorkingCopy::new_untitled(
                identity.clone(),
                None,
                None,
                self.storage.clone(),
                self.backups.clone(),
            )
        } else {
            WorkingCopy::new(identity.clone(), self.storage.clone(), self.backups.clone())
        };
        self.register(&copy);

        let pending = self.resolutions.track(
            identity.clone(),
            self.resolve_task(copy.clone(), resolve_options, true),
        );

        // A new copy is loaded to the end even when every caller gives up.
        let driver = pending.clone();
        tokio::spawn(async move {
            let _ = driver.wait().await;
        });

        Step::Wait { copy, pending }
    }

    fn resolve_task(
        &self,
        copy: Arc<WorkingCopy>,
        options: ResolveOptions,
        created: bool,
    ) -> BoxFuture<'static, Result<(), WorkingCopyError>> {
        let me = self.me.clone();
        async move {
            let result = copy.resolve(options).await;
            if created {
                match &result {
                    Ok(()) => {
                        if let Some(registry) = me.upgrade() {
                            debug!("[working copy] Created {}", copy.identity());
                            registry.on_did_create.fire(copy.identity());
                        }
                    }
                    // Nothing must linger after a failed first load.
                    Err(_) => copy.dispose(),
                }
            }
            result
        }
        .boxed()
    }

    fn register(&self, copy: &Arc<WorkingCopy>) {
        let mut listeners = Vec::with_capacity(7);

        listeners.push(self.forward(copy.on_did_resolve(), |r| &r.on_did_resolve));
        listeners.push(self.forward(copy.on_did_change_dirty(), |r| &r.on_did_change_dirty));
        listeners.push(self.forward(copy.on_did_change_content(), |r| &r.on_did_change_content));
        listeners.push(self.forward(copy.on_did_save_error(), |r| &r.on_did_save_error));
        listeners.push(self.forward(copy.on_did_revert(), |r| &r.on_did_revert));
        listeners.push({
            let me = self.me.clone();
            copy.on_did_save().subscribe(move |event| {
                if let Some(registry) = me.upgrade() {
                    registry.on_did_save.fire(event);
                }
            })
        });
        listeners.push({
            let me = self.me.clone();
            let instance = Arc::downgrade(copy);
            copy.on_did_dispose().subscribe(move |identity| {
                if let Some(registry) = me.upgrade() {
                    registry.forget(identity, &instance);
                }
            })
        });

        let previous = self.copies.lock().insert(
            copy.identity().clone(),
            Tracked {
                copy: copy.clone(),
                listeners,
            },
        );
        if let Some(previous) = previous {
            warn!(
                "[working copy] Replacing live copy of {} in the registry",
                previous.copy.identity()
            );
        }
    }

    fn forward(
        &self,
        source: &Emitter<WorkingCopyIdentity>,
        target: fn(&Self) -> &Emitter<WorkingCopyIdentity>,
    ) -> Subscription {
        let me = self.me.clone();
        source.subscribe(move |identity| {
            if let Some(registry) = me.upgrade() {
                target(&registry).fire(identity);
            }
        })
    }

    fn forget(&self, identity: &WorkingCopyIdentity, instance: &Weak<WorkingCopy>) {
        let removed = {
            let mut copies = self.copies.lock();
            match copies.get(identity) {
                Some(tracked) if Arc::as_ptr(&tracked.copy) == instance.as_ptr() => {
                    copies.remove(identity)
                }
                _ => None,
            }
        };

        if let Some(tracked) = removed {
            drop(tracked.listeners);
            debug!("[working copy] Removed {} from the registry", identity);
            self.on_did_dispose.fire(identity);
        }
    }

    /// Create and register a new untitled copy named `Untitled-N`.
    pub async fn create_untitled(
        &self,
        type_id: &str,
        options: CreateUntitledOptions,
    ) -> Result<Arc<WorkingCopy>, WorkingCopyError> {
        let copy = {
            let _decide = self.decide.lock();
            let identity = loop {
                let n = self.untitled_counter.fetch_add(1, Ordering::SeqCst) + 1;
                let resource = Url::parse(&format!("{}:Untitled-{}", UNTITLED_SCHEME, n))
                    .map_err(|e| WorkingCopyError::InvalidArgument(e.to_string()))?;
                let identity = WorkingCopyIdentity::new(type_id, resource);
                if self.get(&identity).is_none() && !self.resolutions.is_pending(&identity) {
                    break identity;
                }
            };

            let copy = WorkingCopy::new_untitled(
                identity,
                options.associated_path,
                options.initial_value,
                self.storage.clone(),
                self.backups.clone(),
            );
            self.register(&copy);
            copy
        };

        if let Err(e) = copy.resolve(ResolveOptions::default()).await {
            copy.dispose();
            return Err(e);
        }
        self.on_did_create.fire(copy.identity());
        Ok(copy)
    }

    /// Move `source` (and everything under it) to `target` in storage and
    /// carry affected working copies along, unsaved changes included.
    #[instrument(skip(self), level = "debug")]
    pub async fn move_resource(&self, source: &Url, target: &Url) -> Result<(), WorkingCopyError> {
        if source == target {
            return Ok(());
        }

        let affected: Vec<(Arc<WorkingCopy>, WorkingCopyIdentity, Option<Vec<u8>>)> = self
            .working_copies()
            .into_iter()
            .filter(|copy| is_equal_or_parent(copy.resource(), source))
            .map(|copy| {
                let moved = copy.identity().with_resource(moved_resource(copy.resource(), source, target));
                let snapshot = copy.is_dirty().then(|| copy.content());
                (copy, moved, snapshot)
            })
            .collect();

        self.storage
            .move_file(source, target)
            .await
            .map_err(|e| WorkingCopyError::save(source, e))?;

        for (copy, _, _) in &affected {
            copy.dispose();
        }

        let results = join_all(affected.into_iter().map(|(_, moved, snapshot)| async move {
            let options = match snapshot {
                Some(contents) => RegistryResolveOptions {
                    reload: None,
                    contents: Some(contents),
                },
                None => RegistryResolveOptions {
                    reload: Some(ReloadMode::Sync),
                    contents: None,
                },
            };
            self.resolve(&moved, options).await.map(|_| ())
        }))
        .await;

        info!("[working copy] Moved {} to {}", source, target);
        results.into_iter().collect()
    }

    /// Completes once `copy` can be released without losing data: it is
    /// neither resolving nor dirty.
    pub async fn can_dispose(&self, copy: &Arc<WorkingCopy>) {
        loop {
            if copy.is_disposed() {
                return;
            }
            if let Some(pending) = self.resolutions.join(copy.identity()) {
                let _ = pending.wait().await;
                continue;
            }
            if !copy.is_dirty() {
                return;
            }

            let (tx, rx) = oneshot::channel::<()>();
            let tx = Mutex::new(Some(tx));
            let _subscription = copy.on_did_change_dirty().subscribe(move |_| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            });
            if copy.is_dirty() && !copy.is_disposed() {
                // A disposed copy drops its listeners, which closes the channel.
                let _ = rx.await;
            }
        }
    }

    /// Reload clean copies when storage reports changes made elsewhere.
    pub fn watch_storage_changes(&self) {
        let mut changes = self.storage.subscribe_changes();
        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) => match me.upgrade() {
                        Some(registry) => registry.on_storage_changes(&event),
                        None => break,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[working copy] Missed {} storage change events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    fn on_storage_changes(&self, event: &FileChangesEvent) {
        if self.is_suspended() {
            debug!("[working copy] Ignoring storage changes while suspended");
            return;
        }

        for copy in self.working_copies() {
            if copy.is_dirty() || !copy.is_resolved() {
                continue;
            }
            if event.contains(
                copy.resource(),
                &[FileChangeType::Added, FileChangeType::Updated],
            ) {
                self.queue_reload(&copy);
            }
        }
    }

    fn queue_reload(&self, copy: &Arc<WorkingCopy>) {
        let me = self.me.clone();
        let identity = copy.identity().clone();
        self.reloads.queue(identity.clone(), async move {
            let Some(registry) = me.upgrade() else {
                return;
            };
            let options = RegistryResolveOptions {
                reload: Some(ReloadMode::Sync),
                contents: None,
            };
            if let Err(e) = registry.resolve(&identity, options).await {
                warn!("[working copy] Reload of {} failed: {}", identity, e);
            }
        });
    }

    /// Stop reacting to storage changes until the guard is dropped.
    pub fn suspend(&self) -> SuspendGuard {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        SuspendGuard {
            counter: self.suspended.clone(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) > 0
    }

    /// Dispose every copy and stop watching storage.
    pub fn dispose(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        self.resolutions.clear();

        for copy in self.working_copies() {
            copy.dispose();
        }
        self.copies.lock().clear();
    }
}

/// Where `resource` ends up when `source` is moved to `target`.
fn moved_resource(resource: &Url, source: &Url, target: &Url) -> Url {
    if resource == source {
        return target.clone();
    }
    let source_path = source.path().trim_end_matches('/');
    let suffix = resource.path().get(source_path.len()..).unwrap_or_default();
    let mut moved = target.clone();
    moved.set_path(&format!("{}{}", target.path().trim_end_matches('/'), suffix));
    moved
}

impl fmt::Debug for WorkingCopyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingCopyRegistry")
            .field("storage", &self.storage.backend_name())
            .field("copies", &self.len())
            .field("pending", &self.resolutions.len())
            .finish_non_exhaustive()
    }
}
