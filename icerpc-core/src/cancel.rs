//! A cooperative cancellation signal. `Invoke`, `Dispatch`, and
//! `ShutdownAsync` all observe one of these (spec §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cloneable, idempotent cancel signal. Any clone can fire it; every clone
/// observes the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
    /// A fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is already cancelled (spec §8 scenario 5).
    pub fn already_cancelled() -> Self {
        let token = Self::new();
        token.cancel();
        token
    }

    /// Fires the signal. A no-op if already cancelled.
    pub fn cancel(&self) {
        if !self.0.cancelled.swap(true, Ordering::AcqRel) {
            self.0.notify.notify_waiters();
        }
    }

    /// `true` once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once this token is cancelled; returns immediately if it
    /// already is.
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_fired() {
        let token = CancelToken::already_cancelled();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn cancelled_wakes_pending_waiter() {
        let token = CancelToken::new();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        token.cancel();
        waiter.await.unwrap();
    }

    #[test]
    fn second_cancel_is_a_no_op() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}
