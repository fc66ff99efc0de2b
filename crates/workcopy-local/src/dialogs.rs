use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use workcopy_core::{Confirm, ConfirmResult, ProgressOptions, ProgressReporter};

/// Line source shared by the session and the dialogs.
pub type Input = Arc<tokio::sync::Mutex<Lines<BufReader<Stdin>>>>;

pub fn stdin_input() -> Input {
    Arc::new(tokio::sync::Mutex::new(
        BufReader::new(tokio::io::stdin()).lines(),
    ))
}

/// Print `prompt` and read one line. `None` when input is closed.
pub async fn read_line(input: &Input, prompt: &str) -> Option<String> {
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
    match input.lock().await.next_line().await {
        Ok(line) => line.map(|line| line.trim().to_string()),
        Err(e) => {
            debug!("Failed to read input: {}", e);
            None
        }
    }
}

/// Interpret a save confirmation answer.
fn parse_confirm(answer: &str) -> Option<ConfirmResult> {
    match answer.to_ascii_lowercase().as_str() {
        "s" | "save" => Some(ConfirmResult::Save),
        "d" | "dont-save" | "don't save" => Some(ConfirmResult::DontSave),
        "c" | "cancel" => Some(ConfirmResult::Cancel),
        _ => None,
    }
}

/// Interpret a save target answer relative to `cwd`. Empty keeps `suggested`.
pub(crate) fn parse_target(answer: &str, suggested: &Url, cwd: &Path) -> Option<Url> {
    if answer.is_empty() {
        return Some(suggested.clone());
    }
    if answer.contains("://") {
        return Url::parse(answer).ok();
    }
    Url::from_file_path(cwd.join(answer)).ok()
}

/// `Confirm` on the terminal.
///
/// With `assume` set every confirmation is answered without asking, for
/// scripted sessions.
pub struct TerminalDialogs {
    input: Input,
    assume: Option<ConfirmResult>,
    cwd: std::path::PathBuf,
}

impl TerminalDialogs {
    pub fn new(input: Input, assume: Option<ConfirmResult>, cwd: std::path::PathBuf) -> Self {
        Self { input, assume, cwd }
    }
}

#[async_trait]
impl Confirm for TerminalDialogs {
    async fn confirm(&self, message: &str, detail: &str) -> ConfirmResult {
        println!("{}", message);
        println!("{}", detail);
        if let Some(answer) = self.assume {
            info!("Answering {:?} without asking", answer);
            return answer;
        }

        loop {
            let Some(answer) = read_line(&self.input, "[s]ave / [d]on't save / [c]ancel: ").await else {
                return ConfirmResult::Cancel;
            };
            match parse_confirm(&answer) {
                Some(result) => return result,
                None => println!("Please answer s, d or c."),
            }
        }
    }

    async fn confirm_overwrite(&self, resource: &Url) -> bool {
        if let Some(answer) = self.assume {
            return answer != ConfirmResult::Cancel;
        }
        let prompt = format!("{} already exists. Replace it? [y/N]: ", resource);
        matches!(
            read_line(&self.input, &prompt).await.as_deref(),
            Some("y" | "Y" | "yes")
        )
    }

    async fn pick_save_target(&self, suggested: &Url) -> Option<Url> {
        if self.assume.is_some() {
            return Some(suggested.clone());
        }
        loop {
            let prompt = format!("Save as [{}] (- to cancel): ", suggested);
            let answer = read_line(&self.input, &prompt).await?;
            if answer == "-" {
                return None;
            }
            match parse_target(&answer, suggested, &self.cwd) {
                Some(target) => return Some(target),
                None => println!("Not a valid path: {}", answer),
            }
        }
    }

    fn error(&self, message: &str, detail: &str) {
        eprintln!("error: {}", message);
        eprintln!("{}", detail);
    }
}

/// `ProgressReporter` that logs instead of drawing.
///
/// The token of the visible progress can be cancelled from outside, which is
/// how a second interrupt stops waiting for a slow shutdown.
#[derive(Default)]
pub struct LogProgress {
    current: Mutex<Option<CancellationToken>>,
}

impl LogProgress {
    /// Cancel the visible progress, if any. Returns whether one was visible.
    pub fn cancel_current(&self) -> bool {
        match self.current.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl ProgressReporter for LogProgress {
    fn show(&self, options: &ProgressOptions, cancel: CancellationToken) {
        info!("{}", options.title);
        if let Some(detail) = &options.detail {
            info!("{}", detail);
        }
        if options.cancellable {
            *self.current.lock() = Some(cancel);
        }
    }

    fn hide(&self) {
        self.current.lock().take();
    }
}
