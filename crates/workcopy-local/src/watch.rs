use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use workcopy_core::{FileChange, FileChangeType, FileChangesEvent, StorageError};

use crate::storage::{is_temp_path, LocalFileStorage};

/// Forwards filesystem events below a directory to the storage change stream.
///
/// Uses the platform watcher (inotify on Linux, FSEvents on macOS, etc.).
/// Watching stops when this is dropped.
pub struct StorageWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl StorageWatcher {
    pub fn start(root: &Path, storage: Arc<LocalFileStorage>) -> Result<Self, StorageError> {
        let (tx, mut rx) = mpsc::channel::<Event>(1000);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if tx.blocking_send(event).is_err() {
                        debug!("Storage watcher task is gone, dropping event");
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| StorageError::Io(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| StorageError::Io(format!("Failed to watch {}: {}", root.display(), e)))?;

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(changes) = to_changes(&event) {
                    debug!("Detected {} storage change(s)", changes.changes.len());
                    storage.publish(changes);
                }
            }
        });

        info!("Watching {} for changes", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
            task,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for StorageWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Translate one notify event, ignoring our own temp files and events that
/// do not change content.
fn to_changes(event: &Event) -> Option<FileChangesEvent> {
    let typed: Vec<(FileChangeType, &PathBuf)> = match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|path| (FileChangeType::Added, path))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|path| (FileChangeType::Deleted, path))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|path| (FileChangeType::Deleted, path))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|path| (FileChangeType::Added, path))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![(FileChangeType::Deleted, from), (FileChangeType::Added, to)],
            _ => return None,
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => return None,
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|path| (FileChangeType::Updated, path))
            .collect(),
        _ => return None,
    };

    let changes: Vec<FileChange> = typed
        .into_iter()
        .filter(|(_, path)| !is_temp_path(path))
        .filter_map(|(change_type, path)| {
            Url::from_file_path(path).ok().map(|resource| FileChange {
                resource,
                change_type,
            })
        })
        .collect();

    if changes.is_empty() {
        None
    } else {
        Some(FileChangesEvent::new(changes))
    }
}
