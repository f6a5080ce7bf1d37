//! Cancellation tokens for blocking waits.
//!
//! A token is shared between the supervisor, a project's scheduler, and the
//! engine's round waits. Cancelling wakes every waiter immediately. Tokens
//! are never global: the supervisor owns one per project plus one for
//! process shutdown, and cancellation flows downward only.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct Inner {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

/// A cloneable cancellation token.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    /// Cancel the token, waking all current and future waiters.
    pub fn cancel(&self) {
        let mut flag = self.inner.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        *flag = true;
        self.inner.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reset a cancelled token so it can be reused for the next wait.
    /// Only the owner (the project's scheduler) resets.
    pub fn reset(&self) {
        let mut flag = self.inner.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        *flag = false;
    }

    /// Block until cancelled or `timeout` elapses. Returns `true` when the
    /// token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.inner.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        while !*flag {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, result) = self
                .inner
                .cv
                .wait_timeout(flag, remaining)
                .unwrap_or_else(|e| e.into_inner());
            flag = guard;
            if result.timed_out() && !*flag {
                return false;
            }
        }
        true
    }
}
