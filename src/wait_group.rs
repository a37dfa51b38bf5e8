use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts in-flight work owned by one consumer or task pool.
///
/// Each [`add`](WaitGroup::add) returns a guard that decrements the count when
/// dropped, including when the owning task panics.
#[derive(Debug, Clone, Default)]
pub(crate) struct WaitGroup {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    drained: Notify,
}

#[must_use = "dropping the guard immediately marks the work as done"]
#[derive(Debug)]
pub(crate) struct WaitGroupGuard {
    inner: Arc<Inner>,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self) -> WaitGroupGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        WaitGroupGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolves once the count is zero.
    pub(crate) async fn wait(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            // Register before checking so a concurrent final `done` is not missed.
            drained.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}
