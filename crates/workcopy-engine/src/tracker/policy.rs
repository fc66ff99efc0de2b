use workcopy_core::{ShutdownReason, WorkbenchState};

use crate::config::{HotExitConfiguration, TrackerConfig};

/// Whether modified working copies are backed up for `reason` instead of
/// asking the user right away.
///
/// `window_count` is only consulted when a window closes.
pub(crate) fn should_backup_before_shutdown(
    config: &TrackerConfig,
    reason: ShutdownReason,
    window_count: usize,
    workbench: WorkbenchState,
) -> bool {
    if !config.hot_exit.is_enabled() {
        return false;
    }
    if config.development_mode {
        return true;
    }

    let restores_window = workbench != WorkbenchState::Empty
        && config.hot_exit == HotExitConfiguration::OnExitAndWindowClose;

    match reason {
        ShutdownReason::Close => {
            if restores_window {
                true
            } else {
                // Closing one of several windows does not quit the application.
                window_count <= 1
            }
        }
        ShutdownReason::Quit | ShutdownReason::Reload => true,
        ShutdownReason::ContextSwitch => restores_window,
    }
}

/// Whether `reason` needs the window count at all.
pub(crate) fn needs_window_count(reason: ShutdownReason) -> bool {
    reason == ShutdownReason::Close
}
