//! Per-invocation compensation stack.
//!
//! Handlers register compensations as they perform side effects. If the
//! invocation fails, the stack is drained last-registered first; a failing or
//! panicking compensation is logged and the rest still run.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::JobflowError;
use crate::worker::panic_message;

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Outcome of draining a [`RollbackStack`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    pub executed: usize,
    pub failed: usize,
}

/// Shared, clonable handle to one invocation's compensations.
#[derive(Clone, Default)]
pub struct RollbackStack {
    entries: Arc<Mutex<Vec<Compensation>>>,
}

impl fmt::Debug for RollbackStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackStack")
            .field("pending", &self.len())
            .finish()
    }
}

impl RollbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&self, compensation: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.entries
            .lock()
            .push(Box::new(move || compensation().boxed()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run and clear every compensation in reverse registration order.
    pub async fn drain(&self, task_name: &str, job_id: &str) -> RollbackSummary {
        let entries = std::mem::take(&mut *self.entries.lock());
        let mut summary = RollbackSummary::default();

        for (position, compensation) in entries.into_iter().enumerate().rev() {
            summary.executed += 1;
            let outcome = AssertUnwindSafe(async move { compensation().await })
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(panic) => Some(format!(
                    "compensation panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            if let Some(message) = failure {
                summary.failed += 1;
                let err = JobflowError::Rollback(message);
                error!(
                    task_name = %task_name,
                    job_id = %job_id,
                    compensation = position,
                    error = %err,
                    "Compensation failed, continuing rollback"
                );
            }
        }

        if summary.executed > 0 {
            debug!(
                task_name = %task_name,
                job_id = %job_id,
                executed = summary.executed,
                failed = summary.failed,
                "🔄 Rollback stack drained"
            );
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drains_in_reverse_order() {
        let stack = RollbackStack::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            stack.push(move || async move {
                order.lock().push(i);
                Ok(())
            });
        }

        let summary = stack.drain("t", "j").await;
        assert_eq!(summary, RollbackSummary { executed: 3, failed: 0 });
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_rollback() {
        let stack = RollbackStack::new();
        let ran = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&ran);
        stack.push(move || async move {
            *counter.lock() += 1;
            Ok(())
        });
        stack.push(|| async { Err(anyhow::anyhow!("vector store down")) });
        stack.push(|| async {
            let fail = true;
            if fail {
                panic!("bad compensation");
            }
            Ok(())
        });

        let summary = stack.drain("t", "j").await;
        assert_eq!(summary.executed, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(*ran.lock(), 1);
    }

    #[tokio::test]
    async fn test_compensation_panicking_before_its_future_is_contained() {
        let stack = RollbackStack::new();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&ran);
        stack.push(move || async move {
            log.lock().push(0);
            Ok(())
        });
        stack.push(|| -> std::future::Ready<anyhow::Result<()>> {
            panic!("compensation closure failed before yielding")
        });

        let summary = stack.drain("t", "j").await;
        assert_eq!(summary, RollbackSummary { executed: 2, failed: 1 });
        assert_eq!(*ran.lock(), vec![0]);
    }
}
