//! Signal-of-Stop: cooperative cancellation for the session driver and the
//! demo's long-running tasks.
//!
//! Clones share state, so cancelling any clone stops every waiter.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all current and future waiters.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Resolve once cancellation has been signaled.
    pub async fn wait(&self) {
        loop {
            let notified = self.internal.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Race `fut` against cancellation; `None` if cancelled first.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }
}
