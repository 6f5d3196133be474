//! Cooperative cancellation shared across a run.
//!
//! One handle cancels; every token observes. Tokens are cheap to clone and
//! safe to await from many tasks at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancels the run. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn token(&self) -> CancelToken {
        CancelToken { shared: self.shared.clone() }
    }
}

/// Observes cancellation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// A token that can never be cancelled.
    pub fn never() -> Self {
        Self { shared: Arc::new(Shared::default()) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Resolve when cancellation happens. Returns immediately if already
    /// cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel
            // cannot slip between check and await.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A connected (handle, token) pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let shared = Arc::new(Shared::default());
    (
        CancelHandle { shared: shared.clone() },
        CancelToken { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_observes_cancel() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        // Await returns immediately once cancelled.
        token.cancelled().await;
    }

    #[tokio::test]
    async fn waiters_wake_on_cancel() {
        let (handle, token) = cancel_pair();
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn never_token_stays_pending() {
        let token = CancelToken::never();
        let result =
            tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(result.is_err());
    }
}
