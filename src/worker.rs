//! # Worker Runtime
//!
//! One [`Worker`] per queue claims jobs from the broker and runs them through
//! the middleware chain into the queue's [`JobProcessor`]. Concurrency per
//! queue is bounded by a semaphore; idle workers sleep until the broker's
//! queue notifier fires or the poll interval elapses.
//!
//! Shutdown is cooperative: once signalled, workers stop claiming and wait
//! for their in-flight jobs.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::broker::QueueBroker;
use crate::config::WorkerConfig;
use crate::error::JobflowError;
use crate::job::{ClaimedJob, JobFailure};
use crate::middleware::{compose, execute_with, Composed, JobExecution, Middleware};
use crate::registry::{JobProcessor, Registry};

pub struct Worker {
    queue_name: String,
    concurrency: usize,
    chain: Composed,
    broker: Arc<dyn QueueBroker>,
    poll_interval: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue_name", &self.queue_name)
            .field("concurrency", &self.concurrency)
            .field("chain", &self.chain)
            .finish()
    }
}

impl Worker {
    pub fn new(
        queue_name: impl Into<String>,
        concurrency: usize,
        processor: Arc<dyn JobProcessor>,
        middlewares: Vec<Arc<dyn Middleware>>,
        broker: Arc<dyn QueueBroker>,
        poll_interval: Duration,
    ) -> Self {
        let chain = compose(
            middlewares,
            execute_with(move |execution| {
                let processor = Arc::clone(&processor);
                async move { processor.process(execution).await }
            }),
        );
        Self {
            queue_name: queue_name.into(),
            concurrency: concurrency.max(1),
            chain,
            broker,
            poll_interval,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let notify = self.broker.notifier(&self.queue_name);
        let mut in_flight = JoinSet::new();

        if let Err(e) = self.broker.ensure_queue(&self.queue_name).await {
            warn!(queue_name = %self.queue_name, error = %e, "Could not ensure queue");
        }
        info!(
            queue_name = %self.queue_name,
            concurrency = self.concurrency,
            broker = self.broker.provider_name(),
            "🚀 Worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            // Reap finished executions so the set doesn't grow unbounded.
            while in_flight.try_join_next().is_some() {}

            match self.broker.claim(&self.queue_name).await {
                Ok(Some(job)) => {
                    let chain = self.chain.clone();
                    let broker = Arc::clone(&self.broker);
                    in_flight.spawn(async move {
                        execute(job, chain, broker).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue_name = %self.queue_name, error = %e, "Claim failed");
                    self.broker.report_error(&self.queue_name, "", &e.to_string());
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        let pending = in_flight.len();
        while in_flight.join_next().await.is_some() {}
        info!(queue_name = %self.queue_name, drained = pending, "🛑 Worker stopped");
    }
}

async fn execute(job: ClaimedJob, chain: Composed, broker: Arc<dyn QueueBroker>) {
    let execution = JobExecution::from(&job);
    let result = match AssertUnwindSafe(chain.call(execution)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(JobflowError::handler(
            &job.queue_name,
            format!("handler panicked: {}", panic_message(panic.as_ref())),
        )),
    };

    let reported = match result {
        Ok(value) => {
            debug!(queue_name = %job.queue_name, job_id = %job.job_id, "Completing job");
            broker.complete(&job, value).await
        }
        Err(error) => broker.fail(&job, JobFailure::from_error(&error)).await,
    };

    if let Err(e) = reported {
        error!(
            queue_name = %job.queue_name,
            job_id = %job.job_id,
            error = %e,
            "Could not report job outcome"
        );
        broker.report_error(&job.queue_name, &job.job_id, &e.to_string());
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Workers for every queue of a registry.
#[derive(Debug)]
pub struct WorkerRuntime {
    shutdown: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl WorkerRuntime {
    pub fn start(
        registry: &Registry,
        broker: Arc<dyn QueueBroker>,
        middlewares: Vec<Arc<dyn Middleware>>,
        config: &WorkerConfig,
    ) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let workers = registry
            .jobs()
            .into_iter()
            .map(|job| {
                let worker = Worker::new(
                    job.name.clone(),
                    job.concurrency.unwrap_or(config.default_concurrency),
                    Arc::clone(&job.processor),
                    middlewares.clone(),
                    Arc::clone(&broker),
                    config.poll_interval(),
                );
                (job.name.clone(), worker.spawn(receiver.clone()))
            })
            .collect();

        Self { shutdown, workers }
    }

    pub fn queues(&self) -> Vec<&str> {
        self.workers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Stop claiming and wait for in-flight jobs.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (queue_name, handle) in self.workers {
            if let Err(e) = handle.await {
                warn!(queue_name = %queue_name, error = %e, "Worker task ended abnormally");
            }
        }
    }
}
