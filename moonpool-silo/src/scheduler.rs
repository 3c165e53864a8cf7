//! Execution scheduler collaborator.
//!
//! The dispatcher decides *whether* a turn may run; the scheduler decides
//! *where*. Each work item is tagged with the activation it runs on so an
//! implementation can keep per-activation affinity.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::types::ActivationId;

/// Runs turns and activation hooks.
pub trait WorkScheduler: fmt::Debug + Send + Sync {
    /// Queue `work` on behalf of `context`.
    fn queue_work_item(&self, context: ActivationId, work: BoxFuture<'static, ()>);
}

/// Scheduler running every work item as a task on the ambient tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct TokioScheduler {
    in_flight: Arc<AtomicUsize>,
}

impl TokioScheduler {
    /// Create a scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Work items queued but not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl WorkScheduler for TokioScheduler {
    fn queue_work_item(&self, context: ActivationId, work: BoxFuture<'static, ()>) {
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            tracing::trace!(activation = %context, "work item started");
            work.await;
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_work_item_runs() {
        let scheduler = TokioScheduler::new();
        let (tx, rx) = oneshot::channel();
        scheduler.queue_work_item(
            ActivationId(1),
            async move {
                let _ = tx.send(42);
            }
            .boxed(),
        );
        assert_eq!(rx.await.expect("work ran"), 42);
    }
}
