//! Tracked background tasks.
//!
//! Every fire-and-forget task (webhook delivery, subscriber senders) is
//! spawned through a [`TaskRegistry`] so shutdown can wait for it with a
//! deadline and abort whatever is left.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::{AbortHandle, JoinSet};

/// Default grace period for draining tasks at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Set of background tasks owned by one component.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<JoinSet<()>>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task.
    ///
    /// Returns `None` once the registry has been shut down.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            tracing::debug!(task = name, "Registry closed, task not spawned");
            return None;
        }
        let mut set = self.inner.lock().ok()?;
        // Reap finished tasks so the set does not grow without bound.
        while let Some(result) = set.try_join_next() {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
        Some(set.spawn(fut))
    }

    /// Number of tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting tasks, wait up to `grace` for running ones, then abort
    /// the rest. Returns the number of aborted tasks.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut set = match self.inner.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return 0,
        };

        let drained = tokio::time::timeout(grace, async {
            while set.join_next().await.is_some() {}
        })
        .await;

        let remaining = set.len();
        if drained.is_err() {
            tracing::warn!(remaining, "Background tasks did not finish in time, aborting");
            set.abort_all();
            while set.join_next().await.is_some() {}
        }
        remaining
    }
}
