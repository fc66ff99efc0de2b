//! Working copy orchestration on top of `workcopy-core`.
//!
//! - `WorkingCopyRegistry` resolves one shared `WorkingCopy` per identity,
//!   joining concurrent resolutions and reloading clean copies on storage changes.
//! - `SaveAsCoordinator` saves a working copy under a new resource.
//! - `WorkingCopyBackupTracker` backs up modified copies in the background and
//!   answers shutdown requests with a veto decision.

mod config;
mod queue;
mod registry;
mod save_as;
mod tracker;
mod working_copy;

#[cfg(test)]
mod test_support;

pub use config::{AutoSaveMode, HotExitConfiguration, SaveAsConfig, TrackerConfig};
pub use queue::{PendingResolution, ReloadQueue, ResolutionQueue};
pub use registry::{
    CreateUntitledOptions, RegistryResolveOptions, ReloadMode, SuspendGuard, WorkingCopyRegistry,
};
pub use save_as::{SaveAsCoordinator, SaveAsOptions};
pub use tracker::{
    BackupSuspension, DiscardScope, ShutdownOutcome, ShutdownPhase, TrackerServices,
    WorkingCopyBackupTracker,
};
pub use working_copy::{
    ModelState, ResolveOptions, RevertOptions, SaveEvent, SaveOptions, SaveReason, WorkingCopy,
};
