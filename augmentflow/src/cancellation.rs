//! Cooperative cancellation for orchestration runs.
//!
//! A [`CancelToken`] is shared between the orchestrator, chunk executors,
//! and batch job adapters. Cancelling is idempotent: the first reason
//! sticks and every later request is a no-op. Holders either poll
//! [`CancelToken::is_cancelled`] between units of work or await
//! [`CancelToken::cancelled`] to react as soon as the request lands.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Token for coordinating cancellation across tasks.
pub struct CancelToken {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .field("reason", &self.reason.lock())
            .finish()
    }
}

impl CancelToken {
    /// Creates a new token in the un-cancelled state.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Requests cancellation with a reason.
    ///
    /// Idempotent: only the first reason is stored, and waiters are woken
    /// exactly once.
    pub fn cancel(&self, reason: impl Into<String>) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            *self.reason.lock() = Some(reason.into());
            self.notify.notify_waiters();
        }
    }

    /// Resolves once cancellation has been requested.
    ///
    /// Returns immediately if the token is already cancelled.
    pub async fn cancelled(&self) {
        let mut notified = std::pin::pin!(self.notify.notified());
        // Register the waiter before re-checking the flag so a cancel that
        // lands in between cannot be missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_initial_state() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_token_cancel() {
        let token = CancelToken::new();

        token.cancel("operator requested");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("operator requested".to_string()));
    }

    #[test]
    fn test_token_idempotent() {
        let token = CancelToken::new();

        token.cancel("first reason");
        token.cancel("second reason");

        // First reason wins
        assert_eq!(token.reason(), Some("first reason".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                token.reason()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("shutting down");

        let reason = waiter.await.unwrap();
        assert_eq!(reason, Some("shutting down".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel("early");

        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should resolve without waiting");
    }

    #[tokio::test]
    async fn test_cancelled_wakes_every_waiter() {
        let token = CancelToken::new();

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let token = token.clone();
            waiters.push(tokio::spawn(async move {
                token.cancelled().await;
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("fan-out stop");

        for waiter in waiters {
            tokio::time::timeout(Duration::from_millis(200), waiter)
                .await
                .expect("waiter should be woken")
                .expect("waiter task should not panic");
        }
    }
}
