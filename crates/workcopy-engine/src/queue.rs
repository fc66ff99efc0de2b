//! Per-identity bookkeeping of in-flight resolutions and reloads.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use workcopy_core::{WorkingCopyError, WorkingCopyIdentity};

type ResolveFuture = Shared<BoxFuture<'static, Result<(), WorkingCopyError>>>;

/// A resolution that concurrent callers can join.
#[derive(Clone)]
pub struct PendingResolution {
    id: u64,
    future: ResolveFuture,
}

impl PendingResolution {
    /// Wait for the resolution to settle.
    pub async fn wait(self) -> Result<(), WorkingCopyError> {
        self.future.await
    }
}

impl fmt::Debug for PendingResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResolution")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    pending: HashMap<WorkingCopyIdentity, PendingResolution>,
}

/// At most one pending resolution per identity.
///
/// An entry is removed as soon as its future settles, before any waiter
/// observes the result, so a waiter that retries never finds its own
/// finished resolution again.
#[derive(Clone, Default)]
pub struct ResolutionQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl ResolutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pending resolution of `identity`, if any.
    pub fn join(&self, identity: &WorkingCopyIdentity) -> Option<PendingResolution> {
        self.inner.lock().pending.get(identity).cloned()
    }

    pub fn is_pending(&self, identity: &WorkingCopyIdentity) -> bool {
        self.inner.lock().pending.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Register `resolve` as the pending resolution of `identity`.
    ///
    /// The future only runs while someone polls the returned handle (or a
    /// clone obtained through `join`).
    pub fn track(
        &self,
        identity: WorkingCopyIdentity,
        resolve: BoxFuture<'static, Result<(), WorkingCopyError>>,
    ) -> PendingResolution {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let queue = Arc::downgrade(&self.inner);
        let key = identity.clone();
        let future = async move {
            let result = resolve.await;
            if let Some(queue) = queue.upgrade() {
                let mut queue = queue.lock();
                if queue.pending.get(&key).map(|p| p.id) == Some(id) {
                    queue.pending.remove(&key);
                }
            }
            result
        }
        .boxed()
        .shared();

        let pending = PendingResolution { id, future };
        if inner.pending.insert(identity.clone(), pending.clone()).is_some() {
            debug!("Replaced pending resolution of {}", identity);
        }
        pending
    }

    /// Forget every pending resolution. Running futures still complete.
    pub fn clear(&self) {
        self.inner.lock().pending.clear();
    }
}

impl fmt::Debug for ResolutionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionQueue")
            .field("pending", &self.len())
            .finish()
    }
}

/// Reloads of one identity run one at a time, with at most one more waiting.
///
/// Further requests while a reload runs and another waits are dropped: the
/// waiting reload will observe their changes anyway.
#[derive(Clone, Default)]
pub struct ReloadQueue {
    slots: Arc<Mutex<HashMap<WorkingCopyIdentity, ReloadSlot>>>,
}

struct ReloadSlot {
    queued: usize,
    lock: Arc<tokio::sync::Mutex<()>>,
}

const MAX_QUEUED_RELOADS: usize = 2;

impl ReloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once earlier reloads of `identity` finished.
    ///
    /// Returns `false` when the request was dropped because the queue of
    /// `identity` is full.
    pub fn queue<F>(&self, identity: WorkingCopyIdentity, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let lock = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(identity.clone()).or_insert_with(|| ReloadSlot {
                queued: 0,
                lock: Arc::new(tokio::sync::Mutex::new(())),
            });
            if slot.queued >= MAX_QUEUED_RELOADS {
                debug!("Dropping reload of {}, one is already waiting", identity);
                return false;
            }
            slot.queued += 1;
            slot.lock.clone()
        };

        let slots = self.slots.clone();
        tokio::spawn(async move {
            {
                let _running = lock.lock().await;
                task.await;
            }
            let mut slots = slots.lock();
            if let Some(slot) = slots.get_mut(&identity) {
                slot.queued -= 1;
                if slot.queued == 0 {
                    slots.remove(&identity);
                }
            }
        });
        true
    }

    /// Running plus waiting reloads of `identity`.
    pub fn size(&self, identity: &WorkingCopyIdentity) -> usize {
        self.slots
            .lock()
            .get(identity)
            .map(|slot| slot.queued)
            .unwrap_or(0)
    }
}

impl fmt::Debug for ReloadQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadQueue")
            .field("identities", &self.slots.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use url::Url;

    fn identity(path: &str) -> WorkingCopyIdentity {
        WorkingCopyIdentity::new("text", Url::parse(path).unwrap())
    }

    #[tokio::test]
    async fn test_entry_is_gone_before_waiters_resume() {
        let queue = ResolutionQueue::new();
        let id = identity("file:///a");

        let pending = queue.track(id.clone(), async { Ok(()) }.boxed());
        let joined = queue.join(&id).unwrap();
        assert!(queue.is_pending(&id));

        pending.wait().await.unwrap();
        assert!(!queue.is_pending(&id));
        joined.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_is_shared() {
        let queue = ResolutionQueue::new();
        let id = identity("file:///a");
        let err = WorkingCopyError::InvalidArgument("boom".into());

        let pending = queue.track(id.clone(), {
            let err = err.clone();
            async move { Err(err) }.boxed()
        });
        let joined = queue.join(&id).unwrap();

        assert_eq!(pending.wait().await, Err(err.clone()));
        assert_eq!(joined.wait().await, Err(err));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_stale_entry_does_not_remove_newer_one() {
        let queue = ResolutionQueue::new();
        let id = identity("file:///a");
        let (release, released) = oneshot::channel::<()>();

        let first = queue.track(
            id.clone(),
            async move {
                let _ = released.await;
                Ok(())
            }
            .boxed(),
        );
        let first_task = tokio::spawn(first.wait());

        let second = queue.track(
            id.clone(),
            std::future::pending::<Result<(), WorkingCopyError>>().boxed(),
        );
        let _ = release.send(());
        first_task.await.unwrap().unwrap();

        assert!(queue.is_pending(&id));
        drop(second);
    }

    #[tokio::test]
    async fn test_reload_queue_caps_at_two() {
        let reloads = ReloadQueue::new();
        let id = identity("file:///a");
        let runs = Arc::new(AtomicUsize::new(0));
        let (release, released) = oneshot::channel::<()>();

        let accepted_first = reloads.queue(id.clone(), {
            let runs = runs.clone();
            async move {
                let _ = released.await;
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });
        let accepted_second = reloads.queue(id.clone(), {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });
        let accepted_third = reloads.queue(id.clone(), async {});

        assert!(accepted_first && accepted_second);
        assert!(!accepted_third);
        assert_eq!(reloads.size(&id), 2);

        let _ = release.send(());
        for _ in 0..100 {
            if reloads.size(&id) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(reloads.size(&id), 0);
    }
}
