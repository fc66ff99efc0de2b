//! Backup tracking for modified working copies.
//!
//! While the session runs, content changes of modified copies are backed up
//! in the background after a short delay. On shutdown the tracker decides,
//! per reason and configuration, whether to back up, autosave, or ask the
//! user, and answers the shutdown signal with a veto or no veto.

mod policy;
mod shutdown;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use workcopy_core::{
    BackupStore, Confirm, Emitter, ProgressReporter, ShutdownHost, ShutdownReason,
    ShutdownSignalReceiver, StorageError, Subscription, WorkingCopyIdentity,
};

use crate::config::TrackerConfig;
use crate::registry::WorkingCopyRegistry;
use crate::save_as::SaveAsCoordinator;
use crate::working_copy::{SaveEvent, WorkingCopy};

/// States visited by one shutdown pass, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Deciding,
    AutoSaving,
    BackingUp,
    Confirming,
    Discarding,
    Vetoed,
    NoVeto,
}

/// Backups removed at the end of a shutdown pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardScope {
    /// Exactly these backups.
    Only(Vec<WorkingCopyIdentity>),
    /// Every backup except these.
    AllExcept(Vec<WorkingCopyIdentity>),
}

/// What one shutdown pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownOutcome {
    pub reason: ShutdownReason,
    pub veto: bool,
    pub phases: Vec<ShutdownPhase>,
    /// Copies with a current backup once the backup step finished.
    pub backed_up: Vec<WorkingCopyIdentity>,
    /// Copies the user was asked about.
    pub confirmed: Vec<WorkingCopyIdentity>,
    /// `None` when nothing was discarded.
    pub discarded: Option<DiscardScope>,
}

/// Collaborators of the tracker.
pub struct TrackerServices {
    pub registry: Arc<WorkingCopyRegistry>,
    pub backups: Arc<dyn BackupStore>,
    pub dialogs: Arc<dyn Confirm>,
    pub progress: Arc<dyn ProgressReporter>,
    pub host: Arc<dyn ShutdownHost>,
    /// Used to save untitled copies when the user chooses to save on shutdown.
    pub save_as: Option<Arc<SaveAsCoordinator>>,
}

/// Keeps background backups from being scheduled while held.
#[must_use = "dropping the suspension resumes backups"]
pub struct BackupSuspension {
    tracker: Weak<WorkingCopyBackupTracker>,
}

impl BackupSuspension {
    pub fn resume(self) {}
}

impl Drop for BackupSuspension {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.resume_backup_operations();
        }
    }
}

impl fmt::Debug for BackupSuspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupSuspension").finish_non_exhaustive()
    }
}

/// Tracks modified working copies and their backups across the session and
/// participates in shutdown.
pub struct WorkingCopyBackupTracker {
    me: Weak<Self>,
    registry: Arc<WorkingCopyRegistry>,
    backups: Arc<dyn BackupStore>,
    dialogs: Arc<dyn Confirm>,
    progress: Arc<dyn ProgressReporter>,
    host: Arc<dyn ShutdownHost>,
    save_as: Option<Arc<SaveAsCoordinator>>,
    config: TrackerConfig,
    ready: AtomicBool,
    unrestored: Mutex<HashSet<WorkingCopyIdentity>>,
    /// Discards requested before `start`, with the saved version if any.
    deferred_discards: Mutex<HashMap<WorkingCopyIdentity, Option<u64>>>,
    pending_backups: DashMap<WorkingCopyIdentity, (u64, CancellationToken)>,
    next_backup_id: AtomicU64,
    suspended: AtomicUsize,
    listeners: Mutex<Vec<Subscription>>,
    on_did_run_backup: Emitter<ShutdownOutcome>,
}

impl WorkingCopyBackupTracker {
    pub fn new(services: TrackerServices, config: TrackerConfig) -> Arc<Self> {
        let tracker = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry: services.registry,
            backups: services.backups,
            dialogs: services.dialogs,
            progress: services.progress,
            host: services.host,
            save_as: services.save_as,
            config,
            ready: AtomicBool::new(false),
            unrestored: Mutex::new(HashSet::new()),
            deferred_discards: Mutex::new(HashMap::new()),
            pending_backups: DashMap::new(),
            next_backup_id: AtomicU64::new(1),
            suspended: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            on_did_run_backup: Emitter::new(),
        });
        tracker.register_listeners();
        tracker
    }

    fn register_listeners(&self) {
        let registry = &self.registry;
        let mut listeners = Vec::with_capacity(5);

        listeners.push({
            let me = self.me.clone();
            registry.on_did_change_content().subscribe(move |identity| {
                if let Some(tracker) = me.upgrade() {
                    tracker.on_did_change_content(identity);
                }
            })
        });
        listeners.push({
            let me = self.me.clone();
            registry.on_did_save().subscribe(move |event| {
                if let Some(tracker) = me.upgrade() {
                    tracker.on_did_save(event);
                }
            })
        });
        listeners.push({
            let me = self.me.clone();
            registry.on_did_revert().subscribe(move |identity| {
                if let Some(tracker) = me.upgrade() {
                    tracker.on_did_revert(identity);
                }
            })
        });
        listeners.push({
            let me = self.me.clone();
            registry.on_did_dispose().subscribe(move |identity| {
                if let Some(tracker) = me.upgrade() {
                    tracker.cancel_backup(identity);
                }
            })
        });
        listeners.push({
            let me = self.me.clone();
            registry.on_did_resolve().subscribe(move |identity| {
                if let Some(tracker) = me.upgrade() {
                    tracker.unrestored.lock().remove(identity);
                }
            })
        });

        *self.listeners.lock() = listeners;
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Fired after every shutdown pass.
    pub fn on_did_run_backup(&self) -> &Emitter<ShutdownOutcome> {
        &self.on_did_run_backup
    }

    /// Whether the backups of the previous session were enumerated.
    /// Backups are never discarded before that.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Backups found at startup that no working copy has picked up yet.
    pub fn unrestored_backups(&self) -> Vec<WorkingCopyIdentity> {
        let mut identities: Vec<WorkingCopyIdentity> =
            self.unrestored.lock().iter().cloned().collect();
        identities.sort();
        identities
    }

    /// Enumerate the backups left by the previous session.
    ///
    /// Until this succeeds the tracker never discards backups. Discards
    /// requested meanwhile are carried out here, unless the copy was
    /// modified again.
    pub async fn start(&self) -> Result<Vec<WorkingCopyIdentity>, StorageError> {
        let identities = self.backups.list_backups().await?;
        {
            let mut unrestored = self.unrestored.lock();
            for identity in &identities {
                let resolved = self
                    .registry
                    .get(identity)
                    .map(|copy| copy.is_resolved())
                    .unwrap_or(false);
                if !resolved {
                    unrestored.insert(identity.clone());
                }
            }
        }
        self.ready.store(true, Ordering::SeqCst);

        let deferred: Vec<(WorkingCopyIdentity, Option<u64>)> =
            self.deferred_discards.lock().drain().collect();
        for (identity, saved_version) in deferred {
            let dirty = self
                .registry
                .get(&identity)
                .map(|copy| copy.is_dirty())
                .unwrap_or(false);
            if dirty {
                continue;
            }
            self.discard_backup_now(&identity, saved_version).await;
            if !self.backups.has_backup_sync(&identity, None) {
                self.unrestored.lock().remove(&identity);
            }
        }

        info!(
            "[backup tracker] Ready, {} backups from the previous session",
            identities.len()
        );
        Ok(self.unrestored_backups())
    }

    /// Resolve a working copy for every unrestored backup.
    pub async fn restore_backups(&self) -> Vec<Arc<WorkingCopy>> {
        let mut restored = Vec::new();
        for identity in self.unrestored_backups() {
            match self.registry.resolve(&identity, Default::default()).await {
                Ok(copy) => restored.push(copy),
                Err(e) => warn!("[backup tracker] Failed to restore {}: {}", identity, e),
            }
        }
        restored
    }

    /// Answer every shutdown request delivered through `receiver`.
    pub fn listen(&self, mut receiver: ShutdownSignalReceiver) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let Some(tracker) = me.upgrade() else {
                    break;
                };
                let decision = tracker
                    .on_before_shutdown(request.reason, &request.token)
                    .await;
                request.respond(decision);
            }
        })
    }

    /// Stop scheduling background backups until the returned guard drops.
    pub fn suspend_backup_operations(&self) -> BackupSuspension {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        BackupSuspension {
            tracker: self.me.clone(),
        }
    }

    fn resume_backup_operations(&self) {
        if self.suspended.fetch_sub(1, Ordering::SeqCst) == 1 {
            for copy in self.registry.modified_working_copies() {
                self.schedule_backup(copy);
            }
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) > 0
    }

    /// Cancel every scheduled or running background backup.
    pub fn cancel_backup_operations(&self) {
        for entry in self.pending_backups.iter() {
            entry.value().1.cancel();
        }
        self.pending_backups.clear();
    }

    pub fn pending_backup_count(&self) -> usize {
        self.pending_backups.len()
    }

    fn cancel_backup(&self, identity: &WorkingCopyIdentity) {
        if let Some((_, (_, token))) = self.pending_backups.remove(identity) {
            token.cancel();
        }
    }

    fn on_did_change_content(&self, identity: &WorkingCopyIdentity) {
        if let Some(copy) = self.registry.get(identity) {
            if copy.is_dirty() {
                self.schedule_backup(copy);
            }
        }
    }

    fn on_did_save(&self, event: &SaveEvent) {
        let identity = &event.identity;
        let still_dirty = self
            .registry
            .get(identity)
            .map(|copy| copy.is_dirty())
            .unwrap_or(false);
        if still_dirty {
            // Edited while the save was running: the backup may be newer.
            debug!(
                "[backup tracker] Keeping backup of {}, modified since version {}",
                identity, event.content_version
            );
            return;
        }

        self.cancel_backup(identity);
        self.discard_backup(identity, Some(event.content_version));
    }

    fn on_did_revert(&self, identity: &WorkingCopyIdentity) {
        self.cancel_backup(identity);
        self.discard_backup(identity, None);
    }

    /// Discard the backup of `identity` unless it is newer than `saved_version`.
    ///
    /// Before the tracker is ready the discard is deferred to `start`.
    fn discard_backup(&self, identity: &WorkingCopyIdentity, saved_version: Option<u64>) {
        if !self.is_ready() {
            debug!(
                "[backup tracker] Deferring discard of {} until ready",
                identity
            );
            let mut deferred = self.deferred_discards.lock();
            let entry = deferred.entry(identity.clone()).or_insert(saved_version);
            *entry = match (*entry, saved_version) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let me = self.me.clone();
        let identity = identity.clone();
        runtime.spawn(async move {
            if let Some(tracker) = me.upgrade() {
                tracker.discard_backup_now(&identity, saved_version).await;
            }
        });
    }

    async fn discard_backup_now(&self, identity: &WorkingCopyIdentity, saved_version: Option<u64>) {
        let Some(version) = self.backups.backup_version(identity) else {
            return;
        };
        if saved_version.is_some_and(|saved| version > saved) {
            debug!(
                "[backup tracker] Keeping backup of {} at version {}, newer than the save",
                identity, version
            );
            return;
        }
        if let Err(e) = self.backups.discard_backup(identity).await {
            warn!("[backup tracker] Failed to discard backup of {}: {}", identity, e);
        }
    }

    fn schedule_backup(&self, copy: Arc<WorkingCopy>) {
        if self.is_suspended() {
            debug!(
                "[backup tracker] Not scheduling backup of {}, suspended",
                copy.identity()
            );
            return;
        }
        if self
            .backups
            .has_backup_sync(copy.identity(), Some(copy.content_version()))
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "[backup tracker] No runtime to back up {}",
                copy.identity()
            );
            return;
        };

        let id = self.next_backup_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self
            .pending_backups
            .insert(copy.identity().clone(), (id, token.clone()))
        {
            previous.cancel();
        }

        let me = self.me.clone();
        let delay = self.config.backup_delay;
        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(tracker) = me.upgrade() {
                tracker.run_scheduled_backup(&copy, &token).await;
                tracker
                    .pending_backups
                    .remove_if(copy.identity(), |_, (pending, _)| *pending == id);
            }
        });
    }

    async fn run_scheduled_backup(&self, copy: &WorkingCopy, token: &CancellationToken) {
        if token.is_cancelled() || copy.is_disposed() || !copy.is_dirty() {
            return;
        }

        let identity = copy.identity();
        let version = copy.content_version();
        if self.backups.has_backup_sync(identity, Some(version)) {
            return;
        }

        let content = match copy.snapshot(token).await {
            Ok(Some(content)) => content,
            Ok(None) => return,
            Err(e) => {
                debug!("[backup tracker] Skipping backup of {}: {}", identity, e);
                return;
            }
        };

        match self.backups.backup(identity, &content, version, token).await {
            Ok(()) => debug!(
                "[backup tracker] Backed up {} at version {}",
                identity, version
            ),
            Err(StorageError::Cancelled(_)) => {}
            Err(e) => warn!("[backup tracker] Failed to back up {}: {}", identity, e),
        }
    }
}

impl Drop for WorkingCopyBackupTracker {
    fn drop(&mut self) {
        self.cancel_backup_operations();
    }
}

impl fmt::Debug for WorkingCopyBackupTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingCopyBackupTracker")
            .field("backups", &self.backups.backend_name())
            .field("config", &self.config)
            .field("ready", &self.is_ready())
            .field("pending_backups", &self.pending_backups.len())
            .finish_non_exhaustive()
    }
}
