use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Autosave setting of the host. Anything but `Off` enables autosave on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoSaveMode {
    #[default]
    Off,
    AfterDelay,
    OnFocusChange,
    OnWindowChange,
}

impl AutoSaveMode {
    pub fn is_enabled(self) -> bool {
        self != AutoSaveMode::Off
    }
}

/// Data-loss-prevention ("hot exit") setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotExitConfiguration {
    /// Never back up on shutdown; always ask.
    Off,
    /// Back up when the application quits or reloads.
    #[default]
    OnExit,
    /// Additionally back up when a window with a folder or workspace closes.
    OnExitAndWindowClose,
}

impl HotExitConfiguration {
    pub fn is_enabled(self) -> bool {
        self != HotExitConfiguration::Off
    }
}

/// Configuration of the backup tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub auto_save: AutoSaveMode,
    pub hot_exit: HotExitConfiguration,
    /// Interactive development session: backup failures never block shutdown.
    pub development_mode: bool,
    /// How long a shutdown step runs before progress is shown.
    pub progress_delay: Duration,
    /// Delay between a content change and its background backup.
    pub backup_delay: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            auto_save: AutoSaveMode::Off,
            hot_exit: HotExitConfiguration::OnExit,
            development_mode: false,
            progress_delay: Duration::from_millis(800),
            backup_delay: Duration::from_millis(1000),
        }
    }
}

/// Configuration of the save-as coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveAsConfig {
    /// Folder offered for documents that have no stored location yet.
    pub default_save_dir: Option<Url>,
}
