//! Cooperative cancellation token.
//!
//! Receive loops block until their caller cancels them. A [`CancellationToken`]
//! is the handle the caller keeps: clones share the same state, and
//! cancelling any clone wakes every task waiting on [`CancellationToken::cancelled`].
//!
//! The token is built on a [`tokio::sync::watch`] channel, so a task that starts
//! waiting after cancellation returns immediately instead of missing the wakeup.

use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation token shared between a receive loop and its caller.
///
/// # Example
///
/// ```
/// use courier_core::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let token = CancellationToken::new();
/// let waiter = token.clone();
///
/// let task = tokio::spawn(async move { waiter.cancelled().await });
/// token.cancel();
/// task.await.unwrap();
/// assert!(token.is_cancelled());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    /// Creates a new, not-yet-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Marks the token as cancelled and wakes pending waiters.
    ///
    /// Cancelling more than once has no further effect.
    pub fn cancel(&self) {
        self.state.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
    }

    /// Returns true when cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Waits until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so the wait can only end by cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_token_is_not_cancelled() {
        assert!(!CancellationToken::new().is_cancelled());
    }

    #[test]
    fn cancel_is_visible_to_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_after_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let waited = tokio::time::timeout(Duration::from_millis(100), token.cancelled()).await;
        assert!(waited.is_ok(), "already cancelled token must not block");
    }

    #[tokio::test]
    async fn cancelled_wakes_waiting_task() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }
}
