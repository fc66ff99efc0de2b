use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use workcopy_core::{
    file_names_message, ConfirmResult, ProgressOptions, ShutdownDecision, ShutdownReason,
    StorageError, WorkbenchState, WorkingCopyError, WorkingCopyIdentity,
};

use super::policy::{needs_window_count, should_backup_before_shutdown};
use super::{DiscardScope, ShutdownOutcome, ShutdownPhase, WorkingCopyBackupTracker};
use crate::save_as::SaveAsOptions;
use crate::working_copy::{RevertOptions, SaveOptions, SaveReason, WorkingCopy};

const BACKUP_FAILED: &str =
    "The following editors with unsaved changes could not be saved to the back up location.";
const ERROR_ADVICE: &str =
    "Try saving or reverting the editors with unsaved changes first and then try again.";

/// Mutable record of one shutdown pass.
struct ShutdownPass {
    reason: ShutdownReason,
    token: CancellationToken,
    phases: Vec<ShutdownPhase>,
    backed_up: Vec<WorkingCopyIdentity>,
    confirmed: Vec<WorkingCopyIdentity>,
    discarded: Option<DiscardScope>,
}

impl ShutdownPass {
    fn new(reason: ShutdownReason, token: CancellationToken) -> Self {
        Self {
            reason,
            token,
            phases: Vec::new(),
            backed_up: Vec::new(),
            confirmed: Vec::new(),
            discarded: None,
        }
    }

    fn enter(&mut self, phase: ShutdownPhase) {
        debug!("[backup tracker] Shutdown ({}) -> {:?}", self.reason, phase);
        self.phases.push(phase);
    }

    fn finish(mut self, veto: bool) -> ShutdownOutcome {
        self.enter(if veto {
            ShutdownPhase::Vetoed
        } else {
            ShutdownPhase::NoVeto
        });
        ShutdownOutcome {
            reason: self.reason,
            veto,
            phases: self.phases,
            backed_up: self.backed_up,
            confirmed: self.confirmed,
            discarded: self.discarded,
        }
    }
}

/// Per-copy result of the backup step.
enum BackupOutcome {
    /// A backup for the current content version already existed.
    Current,
    Written,
    /// Cancelled before the backup was written.
    Skipped,
    Failed(WorkingCopyError),
}

fn identities(copies: &[Arc<WorkingCopy>]) -> Vec<WorkingCopyIdentity> {
    copies.iter().map(|copy| copy.identity().clone()).collect()
}

impl WorkingCopyBackupTracker {
    /// Handle one shutdown request and decide whether to veto it.
    ///
    /// `token` is cancelled by the host when the shutdown budget runs out.
    /// Background backups are cancelled first and stay suspended until the
    /// pass is over.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn on_before_shutdown(
        &self,
        reason: ShutdownReason,
        token: &CancellationToken,
    ) -> ShutdownDecision {
        self.cancel_backup_operations();
        let _suspension = self.suspend_backup_operations();
        let _reloads = self.registry.suspend();

        let mut pass = ShutdownPass::new(reason, token.clone());
        pass.enter(ShutdownPhase::Deciding);

        let modified = self.registry.modified_working_copies();
        let veto = if modified.is_empty() {
            self.on_before_shutdown_without_modified(&mut pass).await
        } else {
            self.on_before_shutdown_with_modified(&mut pass, modified)
                .await
        };

        let outcome = pass.finish(veto);
        info!(
            "[backup tracker] Shutdown ({}) answered with {} after {:?}",
            reason,
            if veto { "veto" } else { "no veto" },
            outcome.phases
        );
        self.on_did_run_backup.fire(&outcome);

        ShutdownDecision { veto }
    }

    async fn on_before_shutdown_with_modified(
        &self,
        pass: &mut ShutdownPass,
        modified: Vec<Arc<WorkingCopy>>,
    ) -> bool {
        if self.config.auto_save.is_enabled() {
            pass.enter(ShutdownPhase::AutoSaving);
            let stored: Vec<Arc<WorkingCopy>> = modified
                .iter()
                .filter(|copy| !copy.is_untitled())
                .cloned()
                .collect();
            self.save_all_before_shutdown(
                &stored,
                SaveReason::Auto,
                false,
                pass.token.child_token(),
            )
            .await;

            pass.enter(ShutdownPhase::Deciding);
            let remaining = self.registry.modified_working_copies();
            if !remaining.is_empty() {
                return self.handle_modified_before_shutdown(pass, remaining).await;
            }

            return self
                .no_veto(pass, DiscardScope::Only(identities(&modified)))
                .await;
        }

        self.handle_modified_before_shutdown(pass, modified).await
    }

    async fn handle_modified_before_shutdown(
        &self,
        pass: &mut ShutdownPass,
        modified: Vec<Arc<WorkingCopy>>,
    ) -> bool {
        let mut backed_up = Vec::new();
        let mut backup_error: Option<StorageError> = None;

        if self.should_backup(pass.reason).await {
            pass.enter(ShutdownPhase::BackingUp);
            match self
                .backup_before_shutdown(&modified, pass.token.child_token())
                .await
            {
                Ok(identities) => backed_up = identities,
                Err(e) => backup_error = Some(e),
            }
            pass.backed_up = backed_up.clone();

            if backup_error.is_none() && backed_up.len() == modified.len() {
                return false;
            }
        }

        let remaining: Vec<Arc<WorkingCopy>> = modified
            .into_iter()
            .filter(|copy| !backed_up.contains(copy.identity()))
            .collect();

        if let Some(e) = backup_error {
            if self.config.development_mode {
                error!("[backup tracker] Error creating backups: {}", e);
                return false;
            }
            self.show_error_dialog(BACKUP_FAILED, &remaining, Some(&e as &dyn Display));
            return true;
        }

        pass.enter(ShutdownPhase::Confirming);
        pass.confirmed = identities(&remaining);
        self.confirm_before_shutdown(pass, remaining).await
    }

    async fn should_backup(&self, reason: ShutdownReason) -> bool {
        let window_count = if needs_window_count(reason) {
            self.host.window_count().await
        } else {
            1
        };
        should_backup_before_shutdown(
            &self.config,
            reason,
            window_count,
            self.host.workbench_state(),
        )
    }

    /// Back up every modified copy that has no backup of its current version.
    ///
    /// Returns the copies that ended up with a current backup. Only a backup
    /// store that is unavailable as a whole is an error; failures of single
    /// copies leave them to the confirmation step. Once `token` is cancelled
    /// no further backup starts, but writes already under way complete and
    /// count.
    async fn backup_before_shutdown(
        &self,
        modified: &[Arc<WorkingCopy>],
        token: CancellationToken,
    ) -> Result<Vec<WorkingCopyIdentity>, StorageError> {
        self.backups.check_available().await?;

        let backed_up = Mutex::new(Vec::new());
        let options = ProgressOptions {
            title: "Backing up editors with unsaved changes is taking a bit longer...".to_string(),
            detail: Some(
                "Click 'Cancel' to stop waiting and to save or revert editors with unsaved changes."
                    .to_string(),
            ),
            cancellable: true,
        };

        self.with_progress_and_cancellation(options, token, |token| {
            let backed_up = &backed_up;
            async move {
                let token = &token;
                join_all(modified.iter().map(|copy| async move {
                    match self.backup_one(copy, token).await {
                        BackupOutcome::Current | BackupOutcome::Written => {
                            backed_up.lock().push(copy.identity().clone());
                        }
                        BackupOutcome::Skipped => {
                            debug!("[backup tracker] Backup of {} cancelled", copy.identity());
                        }
                        BackupOutcome::Failed(e) => {
                            warn!("[backup tracker] {}", e);
                        }
                    }
                }))
                .await;
            }
        })
        .await;

        let mut backed_up = backed_up.into_inner();
        backed_up.sort();
        Ok(backed_up)
    }

    async fn backup_one(&self, copy: &WorkingCopy, token: &CancellationToken) -> BackupOutcome {
        let identity = copy.identity();
        let version = copy.content_version();
        if self.backups.has_backup_sync(identity, Some(version)) {
            return BackupOutcome::Current;
        }
        if token.is_cancelled() {
            return BackupOutcome::Skipped;
        }

        let content = match copy.snapshot(token).await {
            Ok(Some(content)) => content,
            Ok(None) => return BackupOutcome::Skipped,
            Err(e) => return BackupOutcome::Failed(e),
        };

        match self.backups.backup(identity, &content, version, token).await {
            Ok(()) => BackupOutcome::Written,
            Err(StorageError::Cancelled(_)) => BackupOutcome::Skipped,
            Err(e) => BackupOutcome::Failed(WorkingCopyError::backup(copy.resource(), e)),
        }
    }

    async fn confirm_before_shutdown(
        &self,
        pass: &mut ShutdownPass,
        remaining: Vec<Arc<WorkingCopy>>,
    ) -> bool {
        let names: Vec<String> = remaining.iter().map(|c| c.name().to_string()).collect();
        let (message, detail) = save_confirm_text(&names);

        match self.dialogs.confirm(&message, &detail).await {
            ConfirmResult::Save => {
                let before = self.registry.modified_count();
                // The user asked for this, so the shutdown budget no longer applies.
                self.save_all_before_shutdown(
                    &remaining,
                    SaveReason::Explicit,
                    true,
                    CancellationToken::new(),
                )
                .await;
                let saved = before.saturating_sub(self.registry.modified_count());
                if saved < remaining.len() {
                    warn!(
                        "[backup tracker] Only {} of {} editors were saved, vetoing shutdown",
                        saved,
                        remaining.len()
                    );
                    return true;
                }
                self.no_veto(pass, DiscardScope::Only(identities(&remaining)))
                    .await
            }
            ConfirmResult::DontSave => {
                self.revert_all_before_shutdown(&remaining, CancellationToken::new())
                    .await;
                self.no_veto(pass, DiscardScope::Only(identities(&remaining)))
                    .await
            }
            ConfirmResult::Cancel => {
                debug!("[backup tracker] Shutdown cancelled by the user");
                true
            }
        }
    }

    async fn save_all_before_shutdown(
        &self,
        copies: &[Arc<WorkingCopy>],
        reason: SaveReason,
        force: bool,
        token: CancellationToken,
    ) {
        let options = ProgressOptions {
            title: "Saving editors with unsaved changes is taking a bit longer...".to_string(),
            detail: None,
            cancellable: true,
        };

        let results = self
            .with_progress_and_cancellation(options, token, |token| async move {
                let token = &token;
                join_all(copies.iter().map(|copy| async move {
                    if !copy.is_dirty() || token.is_cancelled() {
                        return Ok(());
                    }
                    if copy.is_untitled() {
                        return self.save_untitled(copy, reason).await;
                    }
                    copy.save(SaveOptions { force, reason }).await.map(|_| ())
                }))
                .await
            })
            .await;

        for result in results {
            if let Err(e) = result {
                error!("[backup tracker] Error saving modified working copies: {}", e);
            }
        }
    }

    async fn save_untitled(
        &self,
        copy: &WorkingCopy,
        reason: SaveReason,
    ) -> Result<(), WorkingCopyError> {
        let Some(save_as) = self
            .save_as
            .as_ref()
            .filter(|save_as| save_as.type_id() == copy.type_id())
        else {
            debug!("[backup tracker] No way to save untitled {}", copy.identity());
            return Ok(());
        };

        let options = SaveAsOptions {
            force: true,
            reason,
        };
        save_as
            .save_as(copy.resource(), None, options)
            .await
            .map(|_| ())
    }

    async fn revert_all_before_shutdown(
        &self,
        copies: &[Arc<WorkingCopy>],
        token: CancellationToken,
    ) {
        let options = ProgressOptions {
            title: "Reverting editors with unsaved changes is taking a bit longer...".to_string(),
            detail: None,
            cancellable: true,
        };

        let results = self
            .with_progress_and_cancellation(options, token, |token| async move {
                let token = &token;
                join_all(copies.iter().map(|copy| async move {
                    if !copy.is_dirty() || token.is_cancelled() {
                        return Ok(());
                    }
                    copy.revert(RevertOptions { soft: true }).await
                }))
                .await
            })
            .await;

        for result in results {
            if let Err(e) = result {
                error!("[backup tracker] Error reverting modified working copies: {}", e);
            }
        }
    }

    async fn on_before_shutdown_without_modified(&self, pass: &mut ShutdownPass) -> bool {
        // An empty window keeps nothing around: it could never restore them.
        let keep = if self.host.workbench_state() == WorkbenchState::Empty {
            Vec::new()
        } else {
            self.unrestored_backups()
        };
        self.no_veto(pass, DiscardScope::AllExcept(keep)).await
    }

    async fn no_veto(&self, pass: &mut ShutdownPass, scope: DiscardScope) -> bool {
        pass.enter(ShutdownPhase::Discarding);
        self.discard_backups_before_shutdown(pass, scope).await;
        false
    }

    async fn discard_backups_before_shutdown(&self, pass: &mut ShutdownPass, scope: DiscardScope) {
        if !self.is_ready() {
            debug!("[backup tracker] Not discarding backups before the tracker is ready");
            return;
        }

        let options = ProgressOptions {
            title: "Discarding backups is taking a bit longer...".to_string(),
            detail: None,
            cancellable: true,
        };

        let scope_ref = &scope;
        let errors = self
            .with_progress_and_cancellation(options, CancellationToken::new(), |_token| async move {
                match scope_ref {
                    DiscardScope::Only(discard) => {
                        join_all(discard.iter().map(|identity| self.backups.discard_backup(identity)))
                            .await
                            .into_iter()
                            .filter_map(Result::err)
                            .collect::<Vec<_>>()
                    }
                    DiscardScope::AllExcept(keep) => {
                        self.backups.discard_backups(keep).await.err().into_iter().collect()
                    }
                }
            })
            .await;

        for e in errors {
            error!("[backup tracker] Error discarding backups: {}", e);
        }
        pass.discarded = Some(scope);
    }

    /// Run `work` under `token`, showing progress once it outlives the
    /// configured delay. The progress surface may cancel `token`.
    ///
    /// `work` is always driven to the end: after cancellation it must not
    /// start new I/O, and I/O already started completes.
    async fn with_progress_and_cancellation<T, F, Fut>(
        &self,
        options: ProgressOptions,
        token: CancellationToken,
        work: F,
    ) -> T
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let work = work(token.clone());
        tokio::pin!(work);

        let cancelled = tokio::select! {
            output = &mut work => return output,
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(self.config.progress_delay) => false,
        };
        if cancelled {
            return work.await;
        }

        self.progress.show(&options, token.clone());
        let output = tokio::select! {
            output = &mut work => Some(output),
            _ = token.cancelled() => None,
        };
        self.progress.hide();
        match output {
            Some(output) => output,
            None => {
                debug!("[backup tracker] Cancelled, waiting for started work to settle");
                work.await
            }
        }
    }

    fn show_error_dialog(&self, message: &str, copies: &[Arc<WorkingCopy>], error: Option<&dyn Display>) {
        let names: Vec<String> = copies
            .iter()
            .filter(|copy| copy.is_dirty())
            .map(|copy| copy.name().to_string())
            .collect();
        let detail = if names.is_empty() {
            ERROR_ADVICE.to_string()
        } else {
            format!("{}\n{}", file_names_message(&names), ERROR_ADVICE)
        };

        self.dialogs.error(message, &detail);
        match error {
            Some(e) => error!("[backup tracker] {}: {}", message, e),
            None => error!("[backup tracker] {}", message),
        }
    }
}

/// Message and detail of the save confirmation for `names`.
fn save_confirm_text(names: &[String]) -> (String, String) {
    const LOST: &str = "Your changes will be lost if you don't save them.";
    match names {
        [name] => (
            format!("Do you want to save the changes you made to {}?", name),
            LOST.to_string(),
        ),
        _ => (
            format!(
                "Do you want to save the changes to the following {} files?",
                names.len()
            ),
            format!("{}\n{}", file_names_message(names), LOST),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoSaveMode, HotExitConfiguration, SaveAsConfig, TrackerConfig};
    use crate::registry::{CreateUntitledOptions, WorkingCopyRegistry};
    use crate::save_as::SaveAsCoordinator;
    use crate::test_support::{RecordingProgress, ScriptedDialogs};
    use crate::tracker::TrackerServices;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use url::Url;
    use workcopy_core::memory::{MemoryBackupStore, MemoryStorage};
    use workcopy_core::{BackupStore, ShutdownSignal, StaticShutdownHost, Subscription};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn text(s: &str) -> WorkingCopyIdentity {
        WorkingCopyIdentity::new("text", url(s))
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            backup_delay: Duration::from_secs(60),
            ..Default::default()
        }
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        backups: Arc<MemoryBackupStore>,
        registry: Arc<WorkingCopyRegistry>,
        dialogs: Arc<ScriptedDialogs>,
        progress: Arc<RecordingProgress>,
        tracker: Arc<WorkingCopyBackupTracker>,
        outcomes: Arc<Mutex<Vec<ShutdownOutcome>>>,
        _outcome_listener: Subscription,
    }

    impl Fixture {
        fn new(config: TrackerConfig, windows: usize, workbench: WorkbenchState) -> Self {
            let storage = Arc::new(MemoryStorage::new());
            let backups = Arc::new(MemoryBackupStore::new());
            let registry = WorkingCopyRegistry::new(storage.clone(), backups.clone());
            let dialogs = Arc::new(ScriptedDialogs::default());
            let progress = Arc::new(RecordingProgress::default());
            let save_as = Arc::new(SaveAsCoordinator::new(
                "text",
                registry.clone(),
                dialogs.clone(),
                SaveAsConfig {
                    default_save_dir: Some(url("file:///tmp/")),
                },
            ));
            let tracker = WorkingCopyBackupTracker::new(
                TrackerServices {
                    registry: registry.clone(),
                    backups: backups.clone(),
                    dialogs: dialogs.clone(),
                    progress: progress.clone(),
                    host: Arc::new(StaticShutdownHost::new(windows, workbench)),
                    save_as: Some(save_as),
                },
                config,
            );

            let outcomes = Arc::new(Mutex::new(Vec::new()));
            let listener = {
                let outcomes = outcomes.clone();
                tracker
                    .on_did_run_backup()
                    .subscribe(move |outcome| outcomes.lock().push(outcome.clone()))
            };

            Self {
                storage,
                backups,
                registry,
                dialogs,
                progress,
                tracker,
                outcomes,
                _outcome_listener: listener,
            }
        }

        fn single_window() -> Self {
            Self::new(config(), 1, WorkbenchState::Folder)
        }

        /// A stored copy with content `saved` on disk and `edit` in memory.
        async fn modified(&self, resource: &str, edit: &str) -> Arc<WorkingCopy> {
            let identity = text(resource);
            self.storage.insert(&identity.resource, "saved");
            let copy = self
                .registry
                .resolve(&identity, Default::default())
                .await
                .unwrap();
            copy.set_content(edit).unwrap();
            copy
        }

        async fn untitled(&self, content: &str) -> Arc<WorkingCopy> {
            self.registry
                .create_untitled(
                    "text",
                    CreateUntitledOptions {
                        associated_path: None,
                        initial_value: Some(content.as_bytes().to_vec()),
                    },
                )
                .await
                .unwrap()
        }

        async fn shutdown(&self, reason: ShutdownReason) -> bool {
            self.tracker
                .on_before_shutdown(reason, &CancellationToken::new())
                .await
                .veto
        }

        fn outcome(&self) -> ShutdownOutcome {
            self.outcomes.lock().last().cloned().unwrap()
        }
    }

    #[tokio::test]
    async fn test_current_backup_is_not_written_again() {
        let f = Fixture::new(config(), 1, WorkbenchState::Empty);
        let copy = f.modified("file:///tmp/b.txt", "one").await;
        copy.set_content("two").unwrap();
        copy.set_content("three").unwrap();
        assert_eq!(copy.content_version(), 4);
        f.backups.insert(copy.identity(), "three", 4);

        let veto = f.shutdown(ShutdownReason::Close).await;

        assert!(!veto);
        assert_eq!(f.backups.write_count(), 0);
        let outcome = f.outcome();
        assert_eq!(
            outcome.phases,
            vec![
                ShutdownPhase::Deciding,
                ShutdownPhase::BackingUp,
                ShutdownPhase::NoVeto
            ]
        );
        assert_eq!(outcome.backed_up, vec![copy.identity().clone()]);
        assert_eq!(outcome.discarded, None);
    }

    #[tokio::test]
    async fn test_modified_copies_are_backed_up_on_quit() {
        let f = Fixture::single_window();
        let a = f.modified("file:///tmp/a.txt", "a'").await;
        let u = f.untitled("draft").await;

        assert!(!f.shutdown(ShutdownReason::Quit).await);

        assert_eq!(f.backups.write_count(), 2);
        assert_eq!(f.backups.record(a.identity()).unwrap().content, b"a'".to_vec());
        assert_eq!(f.backups.record(u.identity()).unwrap().content, b"draft".to_vec());
        // Backed up copies stay dirty, they are restored next session.
        assert!(a.is_dirty());
        assert!(f.dialogs.confirms().is_empty());
    }

    #[tokio::test]
    async fn test_failed_backup_write_falls_back_to_confirm() {
        let f = Fixture::single_window();
        let copy = f.modified("file:///tmp/a.txt", "edit").await;
        f.backups.fail_writes(
            copy.resource(),
            StorageError::Unavailable("backup volume offline".into()),
        );
        f.dialogs.set_answer(ConfirmResult::Cancel);

        let veto = f.shutdown(ShutdownReason::Quit).await;

        assert!(veto);
        let outcome = f.outcome();
        assert!(outcome.phases.contains(&ShutdownPhase::Confirming));
        assert_eq!(outcome.confirmed, vec![copy.identity().clone()]);
        assert_eq!(f.dialogs.confirms().len(), 1);
        assert!(f.dialogs.errors().is_empty());
        assert!(copy.is_dirty());
    }

    #[tokio::test]
    async fn test_partial_backup_confirms_only_the_rest() {
        let f = Fixture::single_window();
        let mut copies = Vec::new();
        for i in 0..5 {
            copies.push(f.modified(&format!("file:///tmp/f{}.txt", i), "edit").await);
        }
        for i in [1, 3] {
            f.backups.fail_writes(
                copies[i].resource(),
                StorageError::Io("quota exceeded".into()),
            );
        }
        f.dialogs.set_answer(ConfirmResult::Cancel);

        assert!(f.shutdown(ShutdownReason::Quit).await);

        let outcome = f.outcome();
        assert_eq!(outcome.backed_up.len(), 3);
        assert_eq!(
            outcome.confirmed,
            vec![copies[1].identity().clone(), copies[3].identity().clone()]
        );

        let confirms = f.dialogs.confirms();
        assert_eq!(confirms.len(), 1);
        let (message, detail) = &confirms[0];
        assert_eq!(
            message,
            "Do you want to save the changes to the following 2 files?"
        );
        assert!(detail.contains("f1.txt"));
        assert!(detail.contains("f3.txt"));
        assert!(!detail.contains("f0.txt"));
    }

    #[tokio::test]
    async fn test_unavailable_backup_store_vetoes_with_error() {
        let f = Fixture::single_window();
        f.modified("file:///tmp/report.txt", "edit").await;
        f.backups.set_available(false);

        assert!(f.shutdown(ShutdownReason::Quit).await);

        let errors = f.dialogs.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, BACKUP_FAILED);
        assert!(errors[0].1.contains("report.txt"));
        assert!(errors[0].1.ends_with(ERROR_ADVICE));
        assert!(f.dialogs.confirms().is_empty());
    }

    #[tokio::test]
    async fn test_development_mode_never_blocks_on_backup_errors() {
        let f = Fixture::new(
            TrackerConfig {
                development_mode: true,
                ..config()
            },
            2,
            WorkbenchState::Folder,
        );
        f.modified("file:///tmp/a.txt", "edit").await;
        f.backups.set_available(false);

        assert!(!f.shutdown(ShutdownReason::Close).await);
        assert!(f.dialogs.errors().is_empty());
    }

    #[tokio::test]
    async fn test_secondary_window_close_asks_instead_of_backing_up() {
        let f = Fixture::new(config(), 3, WorkbenchState::Folder);
        let copy = f.modified("file:///tmp/a.txt", "edit").await;
        f.dialogs.set_answer(ConfirmResult::Cancel);

        assert!(f.shutdown(ShutdownReason::Close).await);

        assert_eq!(f.backups.write_count(), 0);
        let (message, _) = &f.dialogs.confirms()[0];
        assert_eq!(
            message,
            "Do you want to save the changes you made to a.txt?"
        );
        assert!(copy.is_dirty());
    }

    #[tokio::test]
    async fn test_dont_save_reverts_and_discards() {
        let f = Fixture::new(
            TrackerConfig {
                hot_exit: HotExitConfiguration::Off,
                ..config()
            },
            1,
            WorkbenchState::Folder,
        );
        f.tracker.start().await.unwrap();
        let stored = f.modified("file:///tmp/a.txt", "edit").await;
        let untitled = f.untitled("draft").await;
        f.backups.insert(stored.identity(), "edit", 1);
        f.dialogs.set_answer(ConfirmResult::DontSave);

        assert!(!f.shutdown(ShutdownReason::Quit).await);

        assert!(!stored.is_dirty());
        assert_eq!(stored.content(), b"saved".to_vec());
        assert!(untitled.is_disposed());
        assert!(f.backups.record(stored.identity()).is_none());
        assert_eq!(
            f.outcome().phases,
            vec![
                ShutdownPhase::Deciding,
                ShutdownPhase::Confirming,
                ShutdownPhase::Discarding,
                ShutdownPhase::NoVeto
            ]
        );
    }

    #[tokio::test]
    async fn test_save_choice_saves_untitled_through_save_as() {
        let f = Fixture::new(
            TrackerConfig {
                hot_exit: HotExitConfiguration::Off,
                ..config()
            },
            1,
            WorkbenchState::Folder,
        );
        let stored = f.modified("file:///tmp/a.txt", "edit").await;
        f.untitled("hello").await;
        f.dialogs.set_answer(ConfirmResult::Save);

        assert!(!f.shutdown(ShutdownReason::Quit).await);

        assert_eq!(f.storage.content(stored.resource()), Some(b"edit".to_vec()));
        assert_eq!(
            f.storage.content(&url("file:///tmp/Untitled-1")),
            Some(b"hello".to_vec())
        );
        assert_eq!(f.registry.modified_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_save_vetoes() {
        let f = Fixture::new(
            TrackerConfig {
                hot_exit: HotExitConfiguration::Off,
                ..config()
            },
            1,
            WorkbenchState::Folder,
        );
        let copy = f.modified("file:///tmp/a.txt", "edit").await;
        f.storage
            .fail_writes(copy.resource(), StorageError::Io("read-only".into()));
        f.dialogs.set_answer(ConfirmResult::Save);

        assert!(f.shutdown(ShutdownReason::Quit).await);
        assert!(copy.is_dirty());
        assert_eq!(f.outcome().discarded, None);
    }

    #[tokio::test]
    async fn test_autosave_saves_stored_copies() {
        let f = Fixture::new(
            TrackerConfig {
                auto_save: AutoSaveMode::AfterDelay,
                ..config()
            },
            1,
            WorkbenchState::Folder,
        );
        f.tracker.start().await.unwrap();
        let copy = f.modified("file:///tmp/a.txt", "edit").await;

        assert!(!f.shutdown(ShutdownReason::Quit).await);

        assert_eq!(f.storage.content(copy.resource()), Some(b"edit".to_vec()));
        let outcome = f.outcome();
        assert_eq!(
            outcome.phases,
            vec![
                ShutdownPhase::Deciding,
                ShutdownPhase::AutoSaving,
                ShutdownPhase::Deciding,
                ShutdownPhase::Discarding,
                ShutdownPhase::NoVeto
            ]
        );
        assert_eq!(
            outcome.discarded,
            Some(DiscardScope::Only(vec![copy.identity().clone()]))
        );
    }

    #[tokio::test]
    async fn test_autosave_leaves_untitled_to_backup() {
        let f = Fixture::new(
            TrackerConfig {
                auto_save: AutoSaveMode::OnFocusChange,
                ..config()
            },
            1,
            WorkbenchState::Folder,
        );
        let untitled = f.untitled("draft").await;

        assert!(!f.shutdown(ShutdownReason::Quit).await);

        assert!(untitled.is_dirty());
        assert!(f.backups.has_backup_sync(untitled.identity(), None));
        assert!(f.outcome().phases.contains(&ShutdownPhase::BackingUp));
    }

    #[tokio::test]
    async fn test_without_modified_keeps_unrestored_backups() {
        let f = Fixture::single_window();
        let handled = text("file:///tmp/a.txt");
        let unrestored = text("file:///tmp/c.txt");
        f.storage.insert(&handled.resource, "a");
        f.backups.insert(&handled, "a'", 1);
        f.backups.insert(&unrestored, "c'", 1);
        f.tracker.start().await.unwrap();

        let copy = f.registry.resolve(&handled, Default::default()).await.unwrap();
        copy.save(Default::default()).await.unwrap();

        assert!(!f.shutdown(ShutdownReason::Quit).await);

        assert_eq!(
            f.backups.list_backups().await.unwrap(),
            vec![unrestored.clone()]
        );
        assert_eq!(
            f.outcome().discarded,
            Some(DiscardScope::AllExcept(vec![unrestored]))
        );
    }

    #[tokio::test]
    async fn test_empty_window_discards_everything() {
        let f = Fixture::new(config(), 1, WorkbenchState::Empty);
        f.backups.insert(&text("file:///tmp/c.txt"), "c'", 1);
        f.tracker.start().await.unwrap();

        assert!(!f.shutdown(ShutdownReason::Close).await);
        assert!(f.backups.is_empty());
    }

    #[tokio::test]
    async fn test_nothing_is_discarded_before_ready() {
        let f = Fixture::new(config(), 1, WorkbenchState::Empty);
        f.backups.insert(&text("file:///tmp/c.txt"), "c'", 1);

        assert!(!f.shutdown(ShutdownReason::Quit).await);
        assert_eq!(f.backups.len(), 1);
        assert_eq!(f.outcome().discarded, None);
    }

    #[tokio::test]
    async fn test_cancelled_shutdown_writes_no_backups() {
        let f = Fixture::single_window();
        let copy = f.modified("file:///tmp/a.txt", "edit").await;
        f.dialogs.set_answer(ConfirmResult::Cancel);
        let token = CancellationToken::new();
        token.cancel();

        let decision = f
            .tracker
            .on_before_shutdown(ShutdownReason::Quit, &token)
            .await;

        assert!(decision.veto);
        assert_eq!(f.backups.write_count(), 0);
        assert_eq!(f.outcome().confirmed, vec![copy.identity().clone()]);
    }

    #[tokio::test]
    async fn test_save_choice_works_after_budget_ran_out() {
        let f = Fixture::single_window();
        let copy = f.modified("file:///tmp/a.txt", "edit").await;
        f.dialogs.set_answer(ConfirmResult::Save);
        let token = CancellationToken::new();
        token.cancel();

        let decision = f
            .tracker
            .on_before_shutdown(ShutdownReason::Quit, &token)
            .await;

        assert!(!decision.veto);
        assert!(!copy.is_dirty());
        assert_eq!(f.storage.content(copy.resource()), Some(b"edit".to_vec()));
        assert_eq!(f.backups.write_count(), 0);
        assert_eq!(
            f.outcome().phases,
            vec![
                ShutdownPhase::Deciding,
                ShutdownPhase::BackingUp,
                ShutdownPhase::Confirming,
                ShutdownPhase::Discarding,
                ShutdownPhase::NoVeto
            ]
        );
    }

    #[tokio::test]
    async fn test_backup_in_flight_completes_after_cancel() {
        let f = Fixture::single_window();
        let copy = f.modified("file:///tmp/a.txt", "edit").await;
        f.backups.set_write_delay(Some(Duration::from_millis(50)));
        f.dialogs.set_answer(ConfirmResult::Cancel);
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                token.cancel();
            })
        };

        let decision = f
            .tracker
            .on_before_shutdown(ShutdownReason::Quit, &token)
            .await;
        canceller.await.unwrap();

        assert!(token.is_cancelled());
        assert!(!decision.veto);
        assert_eq!(f.backups.write_count(), 1);
        assert!(f
            .backups
            .has_backup_sync(copy.identity(), Some(copy.content_version())));
        assert_eq!(f.outcome().backed_up, vec![copy.identity().clone()]);
        assert!(f.dialogs.confirms().is_empty());
    }

    #[tokio::test]
    async fn test_slow_backup_shows_progress() {
        let f = Fixture::new(
            TrackerConfig {
                progress_delay: Duration::from_millis(5),
                ..config()
            },
            1,
            WorkbenchState::Folder,
        );
        f.modified("file:///tmp/a.txt", "edit").await;
        f.backups.set_write_delay(Some(Duration::from_millis(50)));

        assert!(!f.shutdown(ShutdownReason::Quit).await);

        assert_eq!(
            f.progress.shown(),
            vec!["Backing up editors with unsaved changes is taking a bit longer...".to_string()]
        );
        assert_eq!(f.progress.hidden(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_is_answered() {
        let f = Fixture::single_window();
        f.modified("file:///tmp/a.txt", "edit").await;
        f.backups.set_available(false);
        let (signal, receiver) = ShutdownSignal::channel();
        let _listener = f.tracker.listen(receiver);

        let decision = signal
            .request(ShutdownReason::Quit, Duration::from_secs(5))
            .await;

        assert!(decision.veto);
        // Background backups resume once the pass is over.
        assert!(!f.tracker.is_suspended());
        assert!(!f.registry.is_suspended());
    }

    #[test]
    fn test_save_confirm_text() {
        let (message, detail) = save_confirm_text(&["a.txt".to_string()]);
        assert_eq!(message, "Do you want to save the changes you made to a.txt?");
        assert_eq!(detail, "Your changes will be lost if you don't save them.");

        let (message, detail) = save_confirm_text(&["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(
            message,
            "Do you want to save the changes to the following 2 files?"
        );
        assert_eq!(
            detail,
            "a.txt\nb.txt\n\nYour changes will be lost if you don't save them."
        );
    }
}
