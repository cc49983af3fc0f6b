//! Per-build execution context

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_util::sync::CancellationToken;

/// Cancellable scope bound to one build
///
/// Owned by the [`super::Valet`] from registration until the build finishes;
/// the pipeline borrows its token for the whole run.
#[derive(Debug)]
pub struct ExecutionContext {
    build_id: String,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    interrupted: AtomicBool,
    torn_down: Mutex<bool>,
}

impl ExecutionContext {
    pub(crate) fn new(build_id: String) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            build_id,
            cancel: CancellationToken::new(),
            done,
            interrupted: AtomicBool::new(false),
            torn_down: Mutex::new(false),
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Token every blocking backend call of this build listens to
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Hands the build's result trail over to interrupt recovery, then
    /// cancels it
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Set once recovery owns this build's results; the pipeline must stop
    /// persisting them
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Serializes teardown of this run's backend; the flag is `true` once
    /// cleanup has succeeded
    pub(super) async fn teardown_guard(&self) -> MutexGuard<'_, bool> {
        self.torn_down.lock().await
    }

    /// Marks the build as complete; later calls are no-ops
    pub fn signal_done(&self) {
        self.done.send_replace(true);
    }

    #[cfg(test)]
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Waits until the build signals completion
    pub async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives as long as self, so this only returns once done
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_done_returns_after_signal() {
        let ctx = Arc::new(ExecutionContext::new("b1".to_string()));
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.wait_done().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        ctx.signal_done();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_done());
    }

    #[test]
    fn test_interrupt_cancels_and_flags() {
        let ctx = ExecutionContext::new("b1".to_string());
        let token = ctx.token();
        assert!(!ctx.is_interrupted());

        ctx.interrupt();
        assert!(ctx.is_interrupted());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_reaches_token_clones() {
        let ctx = ExecutionContext::new("b1".to_string());
        let token = ctx.token();
        ctx.cancel();
        assert!(token.is_cancelled());
        assert!(ctx.is_cancelled());
        assert!(!ctx.is_interrupted());
    }
}
