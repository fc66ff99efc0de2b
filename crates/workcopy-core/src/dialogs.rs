use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// Answer to a save confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmResult {
    Save,
    DontSave,
    Cancel,
}

/// The user-facing prompt surface.
#[async_trait]
pub trait Confirm: Send + Sync {
    /// Ask whether to save, discard or keep unsaved changes.
    async fn confirm(&self, message: &str, detail: &str) -> ConfirmResult;

    /// Ask whether `resource` may be overwritten.
    async fn confirm_overwrite(&self, resource: &Url) -> bool;

    /// Let the user pick a save target, seeded with `suggested`.
    /// `None` means the user cancelled.
    async fn pick_save_target(&self, suggested: &Url) -> Option<Url>;

    /// Show an error that blocks the current operation.
    fn error(&self, message: &str, detail: &str);
}

const MAX_CONFIRM_FILES: usize = 10;

/// Render a list of document names for a dialog detail, capped at ten entries.
pub fn file_names_message(names: &[String]) -> String {
    let mut message: Vec<String> = names.iter().take(MAX_CONFIRM_FILES).cloned().collect();

    if names.len() > MAX_CONFIRM_FILES {
        let hidden = names.len() - MAX_CONFIRM_FILES;
        if hidden == 1 {
            message.push("...1 additional file not shown".to_string());
        } else {
            message.push(format!("...{} additional files not shown", hidden));
        }
    }

    message.push(String::new());
    message.join("\n")
}
