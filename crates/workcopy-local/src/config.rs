use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;
use workcopy_core::{ConfirmResult, WorkbenchState};
use workcopy_engine::{AutoSaveMode, HotExitConfiguration, SaveAsConfig, TrackerConfig};

/// Configuration for the workcopy-local session.
#[derive(Parser, Debug, Clone)]
#[command(name = "workcopy-local")]
#[command(about = "Edit local files with backups that survive a crash or shutdown")]
pub struct Config {
    /// Workspace directory. Enables file watching and keeps unrestored
    /// backups across sessions.
    #[arg(long, env = "WORKCOPY_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Directory for backups
    #[arg(long, env = "WORKCOPY_BACKUP_DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Default directory suggested when saving untitled documents
    #[arg(long, env = "WORKCOPY_DEFAULT_SAVE_DIR")]
    pub default_save_dir: Option<PathBuf>,

    /// Auto save mode
    #[arg(long, value_enum, default_value = "off", env = "WORKCOPY_AUTO_SAVE")]
    pub auto_save: AutoSave,

    /// Hot exit mode (backups instead of prompts on shutdown)
    #[arg(long, value_enum, default_value = "on-exit", env = "WORKCOPY_HOT_EXIT")]
    pub hot_exit: HotExit,

    /// Never veto shutdown because of backup errors
    #[arg(long, env = "WORKCOPY_DEVELOPMENT_MODE")]
    pub development_mode: bool,

    /// Treat paths that differ only in case as the same file
    #[arg(long, env = "WORKCOPY_CASE_INSENSITIVE")]
    pub case_insensitive: bool,

    /// Number of open windows reported to the shutdown policy
    #[arg(long, default_value = "1", env = "WORKCOPY_WINDOWS")]
    pub windows: usize,

    /// Time a shutdown participant gets before its work is cancelled
    #[arg(long, default_value = "5000", env = "WORKCOPY_SHUTDOWN_BUDGET_MS")]
    pub shutdown_budget_ms: u64,

    /// Delay before slow shutdown work shows progress
    #[arg(long, default_value = "800", env = "WORKCOPY_PROGRESS_DELAY_MS")]
    pub progress_delay_ms: u64,

    /// Delay between an edit and its background backup
    #[arg(long, default_value = "1000", env = "WORKCOPY_BACKUP_DELAY_MS")]
    pub backup_delay_ms: u64,

    /// Answer every confirmation without asking
    #[arg(long, value_enum, env = "WORKCOPY_ASSUME")]
    pub assume: Option<Assume>,
}

impl Config {
    /// Get the effective backup directory.
    pub fn effective_backup_dir(&self) -> PathBuf {
        self.backup_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("workcopy")
                .join("backups")
        })
    }

    pub fn workbench_state(&self) -> WorkbenchState {
        if self.workspace.is_some() {
            WorkbenchState::Folder
        } else {
            WorkbenchState::Empty
        }
    }

    pub fn shutdown_budget(&self) -> Duration {
        Duration::from_millis(self.shutdown_budget_ms)
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            auto_save: self.auto_save.into(),
            hot_exit: self.hot_exit.into(),
            development_mode: self.development_mode,
            progress_delay: Duration::from_millis(self.progress_delay_ms),
            backup_delay: Duration::from_millis(self.backup_delay_ms),
        }
    }

    /// Save-as defaults: the configured directory, else the workspace, else home.
    pub fn save_as_config(&self) -> anyhow::Result<SaveAsConfig> {
        let dir = self
            .default_save_dir
            .clone()
            .or_else(|| self.workspace.clone())
            .or_else(dirs::home_dir);
        let default_save_dir = match dir {
            Some(dir) => {
                let dir = std::path::absolute(&dir)?;
                Some(Url::from_directory_path(&dir).map_err(|_| {
                    anyhow::anyhow!("Not a usable save directory: {}", dir.display())
                })?)
            }
            None => None,
        };
        Ok(SaveAsConfig { default_save_dir })
    }

    pub fn assume(&self) -> Option<ConfirmResult> {
        self.assume.map(Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AutoSave {
    Off,
    AfterDelay,
    OnFocusChange,
    OnWindowChange,
}

impl From<AutoSave> for AutoSaveMode {
    fn from(value: AutoSave) -> Self {
        match value {
            AutoSave::Off => AutoSaveMode::Off,
            AutoSave::AfterDelay => AutoSaveMode::AfterDelay,
            AutoSave::OnFocusChange => AutoSaveMode::OnFocusChange,
            AutoSave::OnWindowChange => AutoSaveMode::OnWindowChange,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HotExit {
    Off,
    OnExit,
    OnExitAndWindowClose,
}

impl From<HotExit> for HotExitConfiguration {
    fn from(value: HotExit) -> Self {
        match value {
            HotExit::Off => HotExitConfiguration::Off,
            HotExit::OnExit => HotExitConfiguration::OnExit,
            HotExit::OnExitAndWindowClose => HotExitConfiguration::OnExitAndWindowClose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Assume {
    Save,
    DontSave,
    Cancel,
}

impl From<Assume> for ConfirmResult {
    fn from(value: Assume) -> Self {
        match value {
            Assume::Save => ConfirmResult::Save,
            Assume::DontSave => ConfirmResult::DontSave,
            Assume::Cancel => ConfirmResult::Cancel,
        }
    }
}
