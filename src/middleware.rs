//! # Middleware Chain
//!
//! Onion-style composition around a job's execution. Each [`Middleware`]
//! receives the [`JobExecution`] and a [`Next`] continuation; calling
//! `next.run(..)` hands control to the next middleware, and the last one
//! hands it to the job's processor.
//!
//! ```text
//!   logging ─► metrics ─► processor
//!      ◄──────────◄──────────┘
//! ```
//!
//! A middleware may call `next` at most once. A second call fails with
//! [`JobflowError::Middleware`] without running anything, so the processor
//! runs at most once per execution.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use jobflow::middleware::{compose, execute_with, JobExecution, LoggingMiddleware, Middleware};
//!
//! let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(LoggingMiddleware)];
//! let chain = compose(
//!     middlewares,
//!     execute_with(|execution: JobExecution| async move { Ok(execution.data) }),
//! );
//! assert_eq!(chain.len(), 1);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{JobflowError, JobflowResult};
use crate::job::ClaimedJob;
use crate::trace::TraceId;

/// One job execution as seen by middlewares and processors.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub queue_name: String,
    pub job_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Raw job payload (`{input, traceId}` for tasks and workflows).
    pub data: Value,
    pub children_values: Arc<HashMap<String, Value>>,
}

impl JobExecution {
    /// Trace id carried in the payload, if the payload has one.
    pub fn trace_id(&self) -> Option<TraceId> {
        self.data
            .get("traceId")
            .and_then(Value::as_str)
            .map(TraceId::from)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl From<&ClaimedJob> for JobExecution {
    fn from(job: &ClaimedJob) -> Self {
        Self {
            queue_name: job.queue_name.clone(),
            job_id: job.job_id.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            data: job.payload.clone(),
            children_values: Arc::clone(&job.children_values),
        }
    }
}

/// Innermost step of a chain.
pub type Execute =
    Arc<dyn Fn(JobExecution) -> BoxFuture<'static, JobflowResult<Value>> + Send + Sync>;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, execution: JobExecution, next: Next) -> JobflowResult<Value>;
}

struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
    execute: Execute,
}

/// A composed chain; cheap to clone and shared by all executions of a queue.
#[derive(Clone)]
pub struct Composed {
    chain: Arc<Chain>,
}

impl std::fmt::Debug for Composed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composed")
            .field(
                "middlewares",
                &self
                    .chain
                    .middlewares
                    .iter()
                    .map(|m| m.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Box an async function as the innermost step.
pub fn execute_with<F, Fut>(f: F) -> Execute
where
    F: Fn(JobExecution) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobflowResult<Value>> + Send + 'static,
{
    Arc::new(move |execution| f(execution).boxed())
}

pub fn compose(middlewares: Vec<Arc<dyn Middleware>>, execute: Execute) -> Composed {
    Composed {
        chain: Arc::new(Chain {
            middlewares,
            execute,
        }),
    }
}

impl Composed {
    pub async fn call(&self, execution: JobExecution) -> JobflowResult<Value> {
        let last = Arc::new(AtomicIsize::new(-1));
        dispatch(Arc::clone(&self.chain), 0, execution, last).await
    }

    pub fn len(&self) -> usize {
        self.chain.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.middlewares.is_empty()
    }
}

/// Continuation handed to a middleware.
#[derive(Clone)]
pub struct Next {
    chain: Arc<Chain>,
    index: usize,
    last: Arc<AtomicIsize>,
}

impl Next {
    pub async fn run(self, execution: JobExecution) -> JobflowResult<Value> {
        dispatch(self.chain, self.index, execution, self.last).await
    }
}

fn dispatch(
    chain: Arc<Chain>,
    index: usize,
    execution: JobExecution,
    last: Arc<AtomicIsize>,
) -> BoxFuture<'static, JobflowResult<Value>> {
    async move {
        let position = index as isize;
        if last.fetch_max(position, Ordering::SeqCst) >= position {
            return Err(JobflowError::Middleware(
                "next() called multiple times".to_string(),
            ));
        }

        match chain.middlewares.get(index).cloned() {
            Some(middleware) => {
                let next = Next {
                    chain: Arc::clone(&chain),
                    index: index + 1,
                    last,
                };
                middleware.handle(execution, next).await
            }
            None => (chain.execute)(execution).await,
        }
    }
    .boxed()
}

/// Span per execution plus start/finish records.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, execution: JobExecution, next: Next) -> JobflowResult<Value> {
        let span = info_span!(
            "job",
            task_name = %execution.queue_name,
            job_id = %execution.job_id,
            trace_id = execution.trace_id().as_ref().map(TraceId::as_str).unwrap_or(""),
            attempt = execution.attempt,
        );

        async move {
            let started = Instant::now();
            debug!("▶️ Job started");
            let result = next.run(execution).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => debug!(duration_ms, "✅ Job finished"),
                Err(e) => warn!(duration_ms, error = %e, "Job failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetrics {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_duration: Duration,
}

/// Per-queue counters.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    metrics: DashMap<String, TaskMetrics>,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, task_name: &str) -> Option<TaskMetrics> {
        self.metrics.get(task_name).map(|m| m.value().clone())
    }

    pub fn snapshot_all(&self) -> HashMap<String, TaskMetrics> {
        self.metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn handle(&self, execution: JobExecution, next: Next) -> JobflowResult<Value> {
        let task_name = execution.queue_name.clone();
        self.metrics.entry(task_name.clone()).or_default().started += 1;

        let started = Instant::now();
        let result = next.run(execution).await;

        let mut entry = self.metrics.entry(task_name).or_default();
        entry.total_duration += started.elapsed();
        if result.is_ok() {
            entry.succeeded += 1;
        } else {
            entry.failed += 1;
        }
        result
    }
}
