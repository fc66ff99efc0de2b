use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use workcopy_core::{Confirm, ConfirmResult, ProgressOptions, ProgressReporter};

/// `Confirm` that answers from a script and records every prompt.
pub struct ScriptedDialogs {
    answer: Mutex<ConfirmResult>,
    overwrite: Mutex<bool>,
    pick: Mutex<Option<Option<Url>>>,
    confirms: Mutex<Vec<(String, String)>>,
    errors: Mutex<Vec<(String, String)>>,
    suggestions: Mutex<Vec<Url>>,
    overwrite_prompts: AtomicUsize,
}

impl Default for ScriptedDialogs {
    fn default() -> Self {
        Self {
            answer: Mutex::new(ConfirmResult::Cancel),
            overwrite: Mutex::new(true),
            pick: Mutex::new(None),
            confirms: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            suggestions: Mutex::new(Vec::new()),
            overwrite_prompts: AtomicUsize::new(0),
        }
    }
}

impl ScriptedDialogs {
    pub fn answering(answer: ConfirmResult) -> Self {
        let dialogs = Self::default();
        dialogs.set_answer(answer);
        dialogs
    }

    pub fn set_answer(&self, answer: ConfirmResult) {
        *self.answer.lock() = answer;
    }

    pub fn set_overwrite(&self, allow: bool) {
        *self.overwrite.lock() = allow;
    }

    /// Script the picker. Without a script it accepts the suggestion.
    pub fn set_pick(&self, pick: Option<Url>) {
        *self.pick.lock() = Some(pick);
    }

    pub fn confirms(&self) -> Vec<(String, String)> {
        self.confirms.lock().clone()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().clone()
    }

    pub fn suggestions(&self) -> Vec<Url> {
        self.suggestions.lock().clone()
    }

    pub fn overwrite_prompts(&self) -> usize {
        self.overwrite_prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Confirm for ScriptedDialogs {
    async fn confirm(&self, message: &str, detail: &str) -> ConfirmResult {
        self.confirms
            .lock()
            .push((message.to_string(), detail.to_string()));
        *self.answer.lock()
    }

    async fn confirm_overwrite(&self, _resource: &Url) -> bool {
        self.overwrite_prompts.fetch_add(1, Ordering::SeqCst);
        *self.overwrite.lock()
    }

    async fn pick_save_target(&self, suggested: &Url) -> Option<Url> {
        self.suggestions.lock().push(suggested.clone());
        match self.pick.lock().clone() {
            Some(pick) => pick,
            None => Some(suggested.clone()),
        }
    }

    fn error(&self, message: &str, detail: &str) {
        self.errors
            .lock()
            .push((message.to_string(), detail.to_string()));
    }
}

/// `ProgressReporter` that counts how often it was shown.
#[derive(Default)]
pub struct RecordingProgress {
    shown: Mutex<Vec<String>>,
    hidden: AtomicUsize,
}

impl RecordingProgress {
    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().clone()
    }

    pub fn hidden(&self) -> usize {
        self.hidden.load(Ordering::SeqCst)
    }
}

impl ProgressReporter for RecordingProgress {
    fn show(&self, options: &ProgressOptions, _cancel: CancellationToken) {
        self.shown.lock().push(options.title.clone());
    }

    fn hide(&self) {
        self.hidden.fetch_add(1, Ordering::SeqCst);
    }
}
