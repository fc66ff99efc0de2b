//! Core traits and types for working copy persistence.
//!
//! This crate defines the abstractions shared between the engine and its hosts:
//! - `Storage`: byte-level access to persisted resources plus change notifications
//! - `BackupStore`: per-identity staging area that survives a process restart
//! - `Confirm`: the user-facing prompt surface
//! - `ProgressReporter`: delayed, cancellable progress for long shutdown passes
//! - `ShutdownHost` / `ShutdownSignal`: shutdown delivery and veto answers
//!
//! `memory` provides in-process implementations of `Storage` and `BackupStore`.

mod backup;
mod dialogs;
mod error;
mod event;
mod identity;
pub mod memory;
mod progress;
mod shutdown;
mod storage;

pub use backup::{BackupRecord, BackupStore};
pub use dialogs::{file_names_message, Confirm, ConfirmResult};
pub use error::{StorageError, WorkingCopyError};
pub use event::{Emitter, Subscription};
pub use identity::{WorkingCopyIdentity, UNTITLED_SCHEME};
pub use progress::{NoopProgress, ProgressOptions, ProgressReporter};
pub use shutdown::{
    ShutdownDecision, ShutdownHost, ShutdownReason, ShutdownRequest, ShutdownSignal,
    ShutdownSignalReceiver, StaticShutdownHost, WorkbenchState,
};
pub use storage::{
    is_equal_or_parent, ChunkStream, FileChange, FileChangeType, FileChangesEvent, FileStat,
    Storage,
};
