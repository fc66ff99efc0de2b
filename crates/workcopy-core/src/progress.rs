use tokio_util::sync::CancellationToken;

/// What a progress surface should display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressOptions {
    pub title: String,
    pub detail: Option<String>,
    pub cancellable: bool,
}

/// User-visible progress for long running shutdown work.
///
/// `show` is only called once an operation outlives the display delay. A
/// cancellable surface cancels `cancel` when the user asks to stop waiting.
pub trait ProgressReporter: Send + Sync {
    fn show(&self, options: &ProgressOptions, cancel: CancellationToken);

    fn hide(&self);
}

/// Progress surface that displays nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn show(&self, _options: &ProgressOptions, _cancel: CancellationToken) {}

    fn hide(&self) {}
}
