//! Per-direction in-flight operation state.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// State for one direction (read or write) of asynchronous I/O.
///
/// The issued flag is the only state shared between the submitting call and
/// the completion task, and it guards against re-arming a direction while an
/// operation on it is still in flight. Completion is signalled through a
/// [`Notify`] so shutdown can wait without polling alone.
#[derive(Debug, Default)]
pub(crate) struct OperationContext {
    in_flight: AtomicBool,
    settled: Notify,
}

impl OperationContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim the direction for a new operation. Returns false if one is
    /// already in flight.
    pub(crate) fn try_begin(&self) -> bool {
        !self.in_flight.swap(true, Ordering::AcqRel)
    }

    /// Mark the in-flight operation complete and wake anyone draining.
    pub(crate) fn complete(&self) {
        self.in_flight.store(false, Ordering::Release);
        self.settled.notify_waiters();
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until the next completion. Callers must re-check
    /// [`is_in_flight`](Self::is_in_flight); a notification can race a
    /// fresh submission.
    pub(crate) async fn settled(&self) {
        self.settled.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_claim_wins() {
        let ctx = OperationContext::new();
        assert!(ctx.try_begin());
        assert!(!ctx.try_begin());
        assert!(ctx.is_in_flight());
    }

    #[test]
    fn completion_releases_the_slot() {
        let ctx = OperationContext::new();
        assert!(ctx.try_begin());
        ctx.complete();
        assert!(!ctx.is_in_flight());
        assert!(ctx.try_begin());
    }

    #[tokio::test]
    async fn settled_wakes_a_draining_waiter() {
        let ctx = std::sync::Arc::new(OperationContext::new());
        assert!(ctx.try_begin());

        let waiter = {
            let ctx = std::sync::Arc::clone(&ctx);
            tokio::spawn(async move {
                while ctx.is_in_flight() {
                    ctx.settled().await;
                }
            })
        };

        // Let the waiter park before completing.
        tokio::task::yield_now().await;
        ctx.complete();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should observe completion")
            .unwrap();
    }
}
