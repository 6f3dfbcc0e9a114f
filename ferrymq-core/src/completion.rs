//! One-shot completion signal with bounded wait.
//!
//! Consumers replace their completion on every (re)start and complete it when
//! the broker confirms cancellation, so `stop` can wait for the confirmation
//! without holding any lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Raised when a bounded wait on a [`Completion`] elapses before the signal.
#[derive(Debug, thiserror::Error)]
#[error("completion not signalled within {0:?}")]
pub struct CompletionTimeout(pub Duration);

/// A one-shot, monotonic "done" signal.
///
/// Once complete it stays complete; `set_complete` may be called any number
/// of times from any task. Waiters are woken on the first transition.
#[derive(Debug, Default)]
pub struct Completion {
    complete: AtomicBool,
    notify: Notify,
}

impl Completion {
    /// Creates a new, pending completion.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal complete and wakes all waiters. Idempotent.
    pub fn set_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Non-blocking snapshot of the signal state.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Waits until the signal is complete or `limit` elapses.
    ///
    /// Returns immediately when the signal is already complete.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionTimeout`] when `limit` elapses first.
    pub async fn wait_until_complete(&self, limit: Duration) -> Result<(), CompletionTimeout> {
        if self.is_complete() {
            return Ok(());
        }

        let deadline = Instant::now() + limit;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before re-checking the flag, otherwise a
            // concurrent set_complete could slip between check and wait.
            notified.as_mut().enable();
            if self.is_complete() {
                return Ok(());
            }

            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => {
                    if self.is_complete() {
                        return Ok(());
                    }
                    // Spurious wakeup from an unrelated notify cycle.
                }
                Err(_) => return Err(CompletionTimeout(limit)),
            }
        }
    }
}
