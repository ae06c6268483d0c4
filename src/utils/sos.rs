//! Signal-of-Stop: cooperative cancellation token.
//!
//! Clones share one flag. Cancelling any clone wakes every waiter; a token
//! never un-cancels, so a fresh one is needed per unit of work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    closing: AtomicBool,
    notify: Notify,
}

#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<Shared>,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Resolves once cancelled; immediately if already cancelled.
    pub async fn wait(&self) {
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not lost.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }
}
