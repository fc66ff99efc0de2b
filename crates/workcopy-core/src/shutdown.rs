use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why the host is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    /// A window is closed.
    Close,
    /// The application quits.
    Quit,
    /// The window reloads.
    Reload,
    /// The window switches to another workspace.
    ContextSwitch,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Close => write!(f, "close"),
            ShutdownReason::Quit => write!(f, "quit"),
            ShutdownReason::Reload => write!(f, "reload"),
            ShutdownReason::ContextSwitch => write!(f, "context-switch"),
        }
    }
}

/// Answer to one shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownDecision {
    pub veto: bool,
}

impl ShutdownDecision {
    pub fn veto() -> Self {
        Self { veto: true }
    }

    pub fn no_veto() -> Self {
        Self { veto: false }
    }
}

/// What the host window currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkbenchState {
    /// No folder or workspace is open.
    Empty,
    Folder,
    Workspace,
}

/// Facts about the host needed to decide the backup policy.
#[async_trait]
pub trait ShutdownHost: Send + Sync {
    /// Number of application windows currently open, including this one.
    async fn window_count(&self) -> usize;

    fn workbench_state(&self) -> WorkbenchState;
}

/// `ShutdownHost` with fixed answers.
#[derive(Debug, Clone, Copy)]
pub struct StaticShutdownHost {
    pub windows: usize,
    pub state: WorkbenchState,
}

impl StaticShutdownHost {
    pub fn new(windows: usize, state: WorkbenchState) -> Self {
        Self { windows, state }
    }
}

#[async_trait]
impl ShutdownHost for StaticShutdownHost {
    async fn window_count(&self) -> usize {
        self.windows
    }

    fn workbench_state(&self) -> WorkbenchState {
        self.state
    }
}

/// One delivered shutdown signal awaiting a veto answer.
#[derive(Debug)]
pub struct ShutdownRequest {
    pub reason: ShutdownReason,
    /// Cancelled by the host when the participant takes too long.
    pub token: CancellationToken,
    reply: oneshot::Sender<ShutdownDecision>,
}

impl ShutdownRequest {
    pub fn respond(self, decision: ShutdownDecision) {
        if self.reply.send(decision).is_err() {
            debug!("Shutdown requester went away before the answer ({:?})", decision);
        }
    }
}

/// Host side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: mpsc::Sender<ShutdownRequest>,
}

/// Participant side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownSignalReceiver {
    rx: mpsc::Receiver<ShutdownRequest>,
}

impl ShutdownSignalReceiver {
    pub async fn recv(&mut self) -> Option<ShutdownRequest> {
        self.rx.recv().await
    }
}

impl ShutdownSignal {
    pub fn channel() -> (Self, ShutdownSignalReceiver) {
        let (tx, rx) = mpsc::channel(4);
        (Self { tx }, ShutdownSignalReceiver { rx })
    }

    /// Deliver `reason` and wait for the veto answer.
    ///
    /// After `budget` the request token is cancelled and the participant gets
    /// one more `budget` to answer. No answer at all is a veto.
    pub async fn request(&self, reason: ShutdownReason, budget: Duration) -> ShutdownDecision {
        let token = CancellationToken::new();
        let (reply, mut answer) = oneshot::channel();
        let request = ShutdownRequest {
            reason,
            token: token.clone(),
            reply,
        };

        if self.tx.send(request).await.is_err() {
            debug!("No shutdown participant listening, nothing to veto");
            return ShutdownDecision::no_veto();
        }

        match tokio::time::timeout(budget, &mut answer).await {
            Ok(Ok(decision)) => return decision,
            Ok(Err(_)) => {
                warn!("Shutdown participant dropped the request without answering");
                return ShutdownDecision::veto();
            }
            Err(_) => {
                warn!(
                    "Shutdown participant did not answer within {:?}, cancelling",
                    budget
                );
                token.cancel();
            }
        }

        match tokio::time::timeout(budget, answer).await {
            Ok(Ok(decision)) => decision,
            _ => {
                warn!("Shutdown participant did not answer after cancellation, vetoing");
                ShutdownDecision::veto()
            }
        }
    }
}
