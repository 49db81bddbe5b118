//! # Lifecycle Event Bridge
//!
//! Turns the broker's job event stream into structured log records and
//! optional [`LifecycleHook`] calls. Hooks are observers only: an error or a
//! panic inside a hook is logged as [`JobflowError::LifecycleHook`] and never
//! reaches the job or the bridge loop.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::QueueBroker;
use crate::error::JobflowError;
use crate::job::{JobEvent, JobEventKind};

#[async_trait]
pub trait LifecycleHook: Send + Sync + 'static {
    async fn on_active(&self, _event: &JobEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_completed(&self, _event: &JobEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_failed(&self, _event: &JobEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_error(&self, _event: &JobEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct LifecycleEventBridge {
    queues: Option<HashSet<String>>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl std::fmt::Debug for LifecycleEventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEventBridge")
            .field("queues", &self.queues)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl LifecycleEventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only bridge events of these queues.
    pub fn for_queues<S: Into<String>>(mut self, queues: impl IntoIterator<Item = S>) -> Self {
        self.queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    fn accepts(&self, event: &JobEvent) -> bool {
        self.queues
            .as_ref()
            .map_or(true, |queues| queues.contains(&event.queue_name))
    }

    /// Subscribe now and bridge events until `stop` is called or the broker
    /// goes away. Events emitted after this call returns are never missed.
    pub fn spawn(self, broker: &dyn QueueBroker) -> LifecycleBridgeHandle {
        let receiver = broker.events();
        let (stop, stopped) = watch::channel(false);
        let handle = tokio::spawn(self.run(receiver, stopped));
        LifecycleBridgeHandle { stop, handle }
    }

    async fn run(self, mut events: broadcast::Receiver<JobEvent>, mut stop: watch::Receiver<bool>) {
        loop {
            let received = tokio::select! {
                received = events.recv() => received,
                _ = stop.changed() => break,
            };
            match received {
                Ok(event) => {
                    self.handle_event(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Lifecycle bridge lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Job event stream closed");
                    break;
                }
            }
        }
    }

    /// Log one event and run the hooks. Returns the number of hooks that failed.
    pub async fn handle_event(&self, event: &JobEvent) -> usize {
        if !self.accepts(event) {
            return 0;
        }
        log_event(event);

        let mut failures = 0;
        for hook in &self.hooks {
            let call = match &event.kind {
                JobEventKind::Active { .. } => hook.on_active(event),
                JobEventKind::Completed { .. } => hook.on_completed(event),
                JobEventKind::Failed { .. } => hook.on_failed(event),
                JobEventKind::Error { .. } => hook.on_error(event),
            };
            let message = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(_) => "hook panicked".to_string(),
            };

            failures += 1;
            let err = JobflowError::LifecycleHook(message);
            error!(
                event = event.kind.name(),
                task_name = %event.queue_name,
                job_id = %event.job_id,
                error = %err,
                "Lifecycle hook failed"
            );
        }
        failures
    }
}

fn log_event(event: &JobEvent) {
    match &event.kind {
        JobEventKind::Active { attempt } => info!(
            task_name = %event.queue_name,
            job_id = %event.job_id,
            attempt,
            "Job active"
        ),
        JobEventKind::Completed { .. } => info!(
            task_name = %event.queue_name,
            job_id = %event.job_id,
            "Job completed"
        ),
        JobEventKind::Failed {
            reason,
            stack,
            attempt,
            will_retry,
        } => error!(
            task_name = %event.queue_name,
            job_id = %event.job_id,
            attempt,
            will_retry,
            reason = %reason,
            stack = stack.as_deref().unwrap_or(""),
            "Job failed"
        ),
        JobEventKind::Error { message } => error!(
            task_name = %event.queue_name,
            job_id = %event.job_id,
            error = %message,
            "Worker error"
        ),
    }
}

#[derive(Debug)]
pub struct LifecycleBridgeHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LifecycleBridgeHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Lifecycle bridge ended abnormally");
        }
    }
}
