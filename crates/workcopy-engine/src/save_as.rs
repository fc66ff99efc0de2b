//! Saving a working copy under a different resource.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument};
use url::Url;

use workcopy_core::{Confirm, Storage, WorkingCopyError, WorkingCopyIdentity};

use crate::config::SaveAsConfig;
use crate::registry::{RegistryResolveOptions, WorkingCopyRegistry};
use crate::working_copy::{RevertOptions, SaveOptions, SaveReason, WorkingCopy};

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveAsOptions {
    /// Write even when the copy saved in place is not dirty.
    pub force: bool,
    pub reason: SaveReason,
}

/// Saves working copies of one type under a new resource.
pub struct SaveAsCoordinator {
    type_id: String,
    registry: Arc<WorkingCopyRegistry>,
    storage: Arc<dyn Storage>,
    dialogs: Arc<dyn Confirm>,
    config: SaveAsConfig,
}

impl SaveAsCoordinator {
    pub fn new(
        type_id: impl Into<String>,
        registry: Arc<WorkingCopyRegistry>,
        dialogs: Arc<dyn Confirm>,
        config: SaveAsConfig,
    ) -> Self {
        let storage = registry.storage().clone();
        Self {
            type_id: type_id.into(),
            registry,
            storage,
            dialogs,
            config,
        }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    fn identity(&self, resource: &Url) -> WorkingCopyIdentity {
        WorkingCopyIdentity::new(self.type_id.clone(), resource.clone())
    }

    /// Save `source` as `target`, asking the user for a target when none is
    /// given.
    ///
    /// Returns the working copy now holding the content, or `None` when the
    /// user cancelled the target picker.
    #[instrument(skip(self, options), level = "debug")]
    pub async fn save_as(
        &self,
        source: &Url,
        target: Option<&Url>,
        options: SaveAsOptions,
    ) -> Result<Option<Arc<WorkingCopy>>, WorkingCopyError> {
        let source_copy = self.registry.get(&self.identity(source));

        let target = match target {
            Some(target) => target.clone(),
            None => match self.pick_target(source, source_copy.as_ref()).await {
                Some(target) => target,
                None => {
                    debug!("[working copy] Save as of {} cancelled", source);
                    return Ok(None);
                }
            },
        };

        if &target == source {
            return self.save_in_place(source, options).await.map(Some);
        }

        if self.is_alias(source, &target).await? {
            return self.move_then_save(source, &target, options).await.map(Some);
        }

        self.copy_then_save(source, source_copy, &target, options)
            .await
            .map(Some)
    }

    async fn pick_target(&self, source: &Url, copy: Option<&Arc<WorkingCopy>>) -> Option<Url> {
        if let Some(path) = copy.and_then(|copy| copy.associated_path()) {
            return Some(path.clone());
        }
        let suggested = self.suggest_target(source, copy);
        self.dialogs.pick_save_target(&suggested).await
    }

    fn suggest_target(&self, source: &Url, copy: Option<&Arc<WorkingCopy>>) -> Url {
        let untitled = self.identity(source).is_untitled();
        if !untitled && self.storage.can_handle(source) {
            return source.clone();
        }

        let name = match copy {
            Some(copy) => copy.name().to_string(),
            None => self.identity(source).name(),
        };
        let folder = self
            .config
            .default_save_dir
            .clone()
            .or_else(|| Url::parse("file:///").ok());

        match folder {
            Some(mut folder) => {
                if !folder.path().ends_with('/') {
                    let path = format!("{}/", folder.path());
                    folder.set_path(&path);
                }
                folder.join(&name).unwrap_or(folder)
            }
            None => source.clone(),
        }
    }

    /// Different URIs that storage maps to the same file, e.g. a case-only
    /// rename on a case-insensitive filesystem.
    async fn is_alias(&self, source: &Url, target: &Url) -> Result<bool, WorkingCopyError> {
        if !self.storage.can_handle(source) || !self.storage.can_handle(target) {
            return Ok(false);
        }

        let source_identity = self
            .storage
            .identity_of(source)
            .await
            .map_err(|e| WorkingCopyError::resolution(source, e))?;
        let target_identity = self
            .storage
            .identity_of(target)
            .await
            .map_err(|e| WorkingCopyError::resolution(target, e))?;
        if source_identity != target_identity {
            return Ok(false);
        }

        self.storage
            .exists(source)
            .await
            .map_err(|e| WorkingCopyError::resolution(source, e))
    }

    async fn save_in_place(
        &self,
        source: &Url,
        options: SaveAsOptions,
    ) -> Result<Arc<WorkingCopy>, WorkingCopyError> {
        let identity = self.identity(source);
        if identity.is_untitled() {
            return Err(WorkingCopyError::InvalidArgument(format!(
                "{} has no location to save to",
                source
            )));
        }

        let copy = match self.registry.get(&identity) {
            Some(copy) => copy,
            None => self.registry.resolve(&identity, Default::default()).await?,
        };
        copy.save(SaveOptions {
            force: options.force,
            reason: options.reason,
        })
        .await?;
        Ok(copy)
    }

    async fn move_then_save(
        &self,
        source: &Url,
        target: &Url,
        options: SaveAsOptions,
    ) -> Result<Arc<WorkingCopy>, WorkingCopyError> {
        debug!("[working copy] Save as of {} to alias {} is a move", source, target);
        self.registry.move_resource(source, target).await?;

        for resource in [source, target] {
            if let Some(copy) = self.registry.get(&self.identity(resource)) {
                copy.save(SaveOptions {
                    force: options.force,
                    reason: options.reason,
                })
                .await?;
                return Ok(copy);
            }
        }

        self.registry
            .resolve(&self.identity(target), Default::default())
            .await
    }

    async fn copy_then_save(
        &self,
        source: &Url,
        source_copy: Option<Arc<WorkingCopy>>,
        target: &Url,
        options: SaveAsOptions,
    ) -> Result<Arc<WorkingCopy>, WorkingCopyError> {
        let content = match source_copy.as_ref().filter(|copy| copy.is_resolved()) {
            Some(copy) => copy.content(),
            None => self
                .storage
                .read_file(source)
                .await
                .map_err(|e| WorkingCopyError::resolution(source, e))?,
        };

        let target_exists = self
            .storage
            .exists(target)
            .await
            .map_err(|e| WorkingCopyError::resolution(target, e))?;

        // An untitled copy created for `target` would silently replace a file
        // that appeared there in the meantime.
        if target_exists {
            let created_for_target = source_copy
                .as_ref()
                .map(|copy| copy.is_untitled() && copy.associated_path() == Some(target))
                .unwrap_or(false);
            if created_for_target && !self.dialogs.confirm_overwrite(target).await {
                return Err(WorkingCopyError::OverwriteDenied {
                    resource: target.clone(),
                });
            }
        }

        let target_identity = self.identity(target);
        let target_copy = match self.registry.get(&target_identity) {
            Some(copy) => copy,
            None => {
                if !target_exists {
                    self.storage
                        .write_file(target, &[])
                        .await
                        .map_err(|e| WorkingCopyError::save(target, e))?;
                }
                self.registry
                    .resolve(&target_identity, RegistryResolveOptions::default())
                    .await?
            }
        };

        target_copy.set_content(content)?;
        target_copy
            .save(SaveOptions {
                force: true,
                reason: options.reason,
            })
            .await?;

        if let Some(copy) = source_copy {
            copy.revert(RevertOptions { soft: true }).await?;
        }

        info!("[working copy] Saved {} as {}", source, target);
        Ok(target_copy)
    }
}

impl fmt::Debug for SaveAsCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveAsCoordinator")
            .field("type_id", &self.type_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CreateUntitledOptions;
    use crate::test_support::ScriptedDialogs;
    use pretty_assertions::assert_eq;
    use workcopy_core::memory::{MemoryBackupStore, MemoryStorage};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        registry: Arc<WorkingCopyRegistry>,
        dialogs: Arc<ScriptedDialogs>,
        save_as: SaveAsCoordinator,
    }

    fn setup_with(storage: MemoryStorage) -> Fixture {
        let storage = Arc::new(storage);
        let registry = WorkingCopyRegistry::new(storage.clone(), Arc::new(MemoryBackupStore::new()));
        let dialogs = Arc::new(ScriptedDialogs::default());
        let save_as = SaveAsCoordinator::new(
            "text",
            registry.clone(),
            dialogs.clone(),
            SaveAsConfig {
                default_save_dir: Some(url("file:///home/user/")),
            },
        );
        Fixture {
            storage,
            registry,
            dialogs,
            save_as,
        }
    }

    fn setup() -> Fixture {
        setup_with(MemoryStorage::new())
    }

    #[tokio::test]
    async fn test_untitled_to_new_file() {
        let f = setup();
        let untitled = f
            .registry
            .create_untitled(
                "text",
                CreateUntitledOptions {
                    associated_path: None,
                    initial_value: Some(b"hello".to_vec()),
                },
            )
            .await
            .unwrap();
        let target = url("file:///tmp/a.txt");

        let saved = f
            .save_as
            .save_as(untitled.resource(), Some(&target), SaveAsOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(saved.resource(), &target);
        assert!(!saved.is_dirty());
        assert_eq!(f.storage.content(&target), Some(b"hello".to_vec()));
        assert!(untitled.is_disposed());
        assert!(f.registry.get(untitled.identity()).is_none());
    }

    #[tokio::test]
    async fn test_save_as_then_in_place_writes_nothing() {
        let f = setup();
        let untitled = f
            .registry
            .create_untitled(
                "text",
                CreateUntitledOptions {
                    associated_path: None,
                    initial_value: Some(b"hello".to_vec()),
                },
            )
            .await
            .unwrap();
        let target = url("file:///tmp/b.txt");

        let saved = f
            .save_as
            .save_as(untitled.resource(), Some(&target), SaveAsOptions::default())
            .await
            .unwrap()
            .unwrap();
        let writes = f.storage.write_count();

        let again = f
            .save_as
            .save_as(saved.resource(), Some(saved.resource()), SaveAsOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert!(Arc::ptr_eq(&saved, &again));
        assert!(!again.is_dirty());
        assert_eq!(f.storage.write_count(), writes);
        assert_eq!(f.storage.content(&target), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_save_as_in_place_is_a_plain_save() {
        let f = setup();
        let resource = url("file:///tmp/a.txt");
        f.storage.insert(&resource, "a");
        let copy = f
            .registry
            .resolve(&WorkingCopyIdentity::new("text", resource.clone()), Default::default())
            .await
            .unwrap();
        copy.set_content("b").unwrap();

        let first = f
            .save_as
            .save_as(&resource, Some(&resource), SaveAsOptions::default())
            .await
            .unwrap()
            .unwrap();
        let second = f
            .save_as
            .save_as(&resource, Some(&resource), SaveAsOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!copy.is_dirty());
        assert_eq!(f.storage.content(&resource), Some(b"b".to_vec()));
        // The second call found nothing to write.
        assert_eq!(f.storage.write_count(), 1);
    }

    #[tokio::test]
    async fn test_case_only_rename_moves_file() {
        let f = setup_with(MemoryStorage::case_insensitive());
        let source = url("file:///tmp/readme.md");
        let target = url("file:///tmp/README.md");
        f.storage.insert(&source, "docs");
        let copy = f
            .registry
            .resolve(&WorkingCopyIdentity::new("text", source.clone()), Default::default())
            .await
            .unwrap();
        copy.set_content("more docs").unwrap();

        let saved = f
            .save_as
            .save_as(&source, Some(&target), SaveAsOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.storage.move_count(), 1);
        assert_eq!(saved.resource(), &target);
        assert!(!saved.is_dirty());
        assert_eq!(f.storage.stored_resource(&source), Some(target.clone()));
        assert_eq!(f.storage.content(&target), Some(b"more docs".to_vec()));
    }

    #[tokio::test]
    async fn test_copy_of_stored_file_keeps_source_on_disk() {
        let f = setup();
        let source = url("file:///tmp/a.txt");
        let target = url("file:///tmp/b.txt");
        f.storage.insert(&source, "saved");
        let copy = f
            .registry
            .resolve(&WorkingCopyIdentity::new("text", source.clone()), Default::default())
            .await
            .unwrap();
        copy.set_content("edited").unwrap();

        f.save_as
            .save_as(&source, Some(&target), SaveAsOptions::default())
            .await
            .unwrap();

        assert_eq!(f.storage.content(&target), Some(b"edited".to_vec()));
        assert_eq!(f.storage.content(&source), Some(b"saved".to_vec()));
        assert!(!copy.is_dirty());
        assert_eq!(copy.content(), b"saved".to_vec());
    }

    #[tokio::test]
    async fn test_overwrite_denied_leaves_everything_untouched() {
        let f = setup();
        let target = url("file:///tmp/a.txt");
        let untitled = f
            .registry
            .create_untitled(
                "text",
                CreateUntitledOptions {
                    associated_path: Some(target.clone()),
                    initial_value: Some(b"new".to_vec()),
                },
            )
            .await
            .unwrap();
        f.storage.insert(&target, "someone else's");
        f.dialogs.set_overwrite(false);

        let err = f
            .save_as
            .save_as(untitled.resource(), None, SaveAsOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkingCopyError::OverwriteDenied { .. }));
        assert_eq!(f.storage.content(&target), Some(b"someone else's".to_vec()));
        assert!(untitled.is_dirty());
        assert!(!untitled.is_disposed());
        assert_eq!(f.dialogs.overwrite_prompts(), 1);
    }

    #[tokio::test]
    async fn test_picker_cancel_returns_none() {
        let f = setup();
        let untitled = f
            .registry
            .create_untitled(
                "text",
                CreateUntitledOptions {
                    associated_path: None,
                    initial_value: Some(b"draft".to_vec()),
                },
            )
            .await
            .unwrap();
        f.dialogs.set_pick(None);

        let result = f
            .save_as
            .save_as(untitled.resource(), None, SaveAsOptions::default())
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(untitled.is_dirty());
        assert_eq!(
            f.dialogs.suggestions(),
            vec![url("file:///home/user/Untitled-1")]
        );
    }
}
