//! # Task Facade
//!
//! A task is one typed, independently schedulable unit of work: a name (which
//! is also its queue), an input schema, an optional output schema and an async
//! handler. Registering a [`TaskDefinition`] yields a [`TaskHandle`] used to
//! dispatch jobs, await them, or embed them in a workflow tree.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use jobflow::broker::InMemoryQueueBroker;
//! use jobflow::registry::Registry;
//! use jobflow::schema::Schema;
//! use jobflow::task::TaskDefinition;
//!
//! # fn main() -> Result<(), jobflow::JobflowError> {
//! let registry = Registry::new();
//! let broker = Arc::new(InMemoryQueueBroker::new());
//!
//! let embed = TaskDefinition::<String, usize>::new("embed")
//!     .input_schema(Schema::new().rule("text must not be empty", |s: &String| !s.is_empty()))
//!     .handler(|text, ctx| async move {
//!         ctx.on_rollback(|| async { Ok(()) });
//!         Ok(text.len())
//!     })
//!     .register(&registry, broker)?;
//! assert_eq!(embed.name(), "embed");
//! # Ok(())
//! # }
//! ```

mod context;
mod handle;
mod rollback;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::broker::QueueBroker;
use crate::constants::defaults;
use crate::error::{JobflowError, JobflowResult};
use crate::job::{ChildSpec, JobData, JobOptions, JobRequest};
use crate::logging::{log_error, log_job_operation};
use crate::middleware::JobExecution;
use crate::registry::{JobKind, JobProcessor, RegisteredJob, Registry};
use crate::schema::{decode_optional, encode_optional, Schema};
use crate::trace::{child_job_id, TraceId};
use crate::worker::panic_message;

pub use context::{BarrierContext, ChildResult, TaskContext};
pub use handle::JobHandle;
pub use rollback::{RollbackStack, RollbackSummary};

/// Bound shared by every task and workflow input/output type.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

type Handler<I, O> =
    Arc<dyn Fn(I, TaskContext) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;

pub struct TaskDefinition<I, O> {
    name: String,
    input_schema: Schema<I>,
    output_schema: Option<Schema<O>>,
    handler: Option<Handler<I, O>>,
    concurrency: Option<usize>,
    attempts: u32,
}

impl<I, O> fmt::Debug for TaskDefinition<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl<I: Payload, O: Payload> TaskDefinition<I, O> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_schema: Schema::new(),
            output_schema: None,
            handler: None,
            concurrency: None,
            attempts: defaults::JOB_ATTEMPTS,
        }
    }

    pub fn input_schema(mut self, schema: Schema<I>) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn output_schema(mut self, schema: Schema<O>) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Jobs of this task run concurrently per worker process.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Total broker attempts per job; handler errors are retried, validation errors are not.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(I, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |input, ctx| handler(input, ctx).boxed()));
        self
    }

    /// Add the task to `registry`. Fails on a missing handler, an invalid
    /// name or a name that is already registered.
    pub fn register(
        self,
        registry: &Registry,
        broker: Arc<dyn QueueBroker>,
    ) -> JobflowResult<TaskHandle<I, O>> {
        let handler = self.handler.ok_or_else(|| {
            JobflowError::configuration(format!("task '{}' has no handler", self.name))
        })?;

        let processor = TaskProcessor {
            name: self.name.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
            handler,
        };
        registry.register(RegisteredJob {
            name: self.name.clone(),
            kind: JobKind::Task,
            concurrency: self.concurrency,
            processor: Arc::new(processor),
        })?;

        Ok(TaskHandle {
            shared: Arc::new(TaskShared {
                name: self.name,
                input_schema: self.input_schema,
                output_schema: self.output_schema,
                attempts: self.attempts,
                broker,
            }),
        })
    }
}

struct TaskShared<I, O> {
    name: String,
    input_schema: Schema<I>,
    output_schema: Option<Schema<O>>,
    attempts: u32,
    broker: Arc<dyn QueueBroker>,
}

/// Caller-side handle of a registered task. Cheap to clone.
pub struct TaskHandle<I, O> {
    shared: Arc<TaskShared<I, O>>,
}

impl<I, O> Clone for TaskHandle<I, O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<I, O> fmt::Debug for TaskHandle<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .field("broker", &self.shared.broker.provider_name())
            .finish()
    }
}

impl<I: Payload, O: Payload> TaskHandle<I, O> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Validate `input` and enqueue one job.
    ///
    /// Validation runs before any broker interaction, and the completion
    /// watcher is attached before the job is enqueued.
    pub async fn dispatch(
        &self,
        input: &I,
        trace_id: Option<TraceId>,
    ) -> JobflowResult<JobHandle<O>> {
        let spec = self.as_child_spec(input, trace_id)?;
        let job_id = spec.job_id().to_string();
        let trace_id = spec.data.trace_id.clone();
        let request = JobRequest::new(self.shared.name.clone(), spec.data.to_value()?, spec.options);

        let outcome = self.shared.broker.watch(&self.shared.name, &job_id);
        if let Err(e) = self.shared.broker.enqueue(request).await {
            drop(outcome);
            self.shared.broker.unwatch(&self.shared.name, &job_id);
            log_error("task_facade", "dispatch", &e.to_string(), Some(&job_id));
            return Err(e.into());
        }

        log_job_operation(
            "dispatch",
            &self.shared.name,
            Some(&job_id),
            Some(trace_id.as_str()),
            "queued",
            None,
        );
        Ok(JobHandle::new(
            job_id,
            self.shared.name.clone(),
            trace_id,
            outcome,
            self.shared.output_schema.clone(),
        ))
    }

    pub async fn run_and_await(&self, input: &I, trace_id: Option<TraceId>) -> JobflowResult<O> {
        self.dispatch(input, trace_id).await?.wait().await
    }

    /// Flow node for this task without dispatching it. The input is validated.
    pub fn as_child_spec(&self, input: &I, trace_id: Option<TraceId>) -> JobflowResult<ChildSpec> {
        let encoded = self.shared.input_schema.encode(input)?;
        let trace_id = TraceId::resolve(trace_id)?;
        let job_id = child_job_id(&self.shared.name, &trace_id);

        Ok(ChildSpec {
            name: self.shared.name.clone(),
            queue_name: self.shared.name.clone(),
            data: JobData::new(encoded, trace_id),
            children: Vec::new(),
            options: JobOptions::new(job_id).with_attempts(self.shared.attempts),
        })
    }
}

impl<I: Payload, O: Payload> ChildResult for TaskHandle<I, O> {
    type Output = O;

    fn child_name(&self) -> &str {
        &self.shared.name
    }

    fn decode_result(&self, value: Value) -> JobflowResult<O> {
        decode_optional(self.shared.output_schema.as_ref(), value)
    }
}

/// Run one handler invocation, turning its error or panic into
/// [`JobflowError::Handler`].
pub(crate) async fn invoke_handler<T, F>(task_name: &str, call: F) -> JobflowResult<T>
where
    F: FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send,
{
    match AssertUnwindSafe(async move { call().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(JobflowError::handler(task_name, format!("{e:#}"))),
        Err(panic) => Err(JobflowError::handler(
            task_name,
            format!("handler panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

/// Worker-side execution of a task job.
struct TaskProcessor<I, O> {
    name: String,
    input_schema: Schema<I>,
    output_schema: Option<Schema<O>>,
    handler: Handler<I, O>,
}

#[async_trait]
impl<I: Payload, O: Payload> JobProcessor for TaskProcessor<I, O> {
    async fn process(&self, execution: JobExecution) -> JobflowResult<Value> {
        let data = JobData::from_value(execution.data)?;
        let input = self.input_schema.parse(data.input)?;
        let ctx = TaskContext::new(
            data.trace_id,
            execution.job_id,
            self.name.clone(),
            execution.attempt,
        );

        let handler = Arc::clone(&self.handler);
        let handler_ctx = ctx.clone();
        let result = invoke_handler(&self.name, move || handler(input, handler_ctx))
            .await
            .and_then(|output| encode_optional(self.output_schema.as_ref(), &output));

        if let Err(error) = &result {
            debug!(
                task_name = %self.name,
                job_id = %ctx.job_id(),
                error = %error,
                pending = ctx.pending_rollbacks(),
                "Task failed, rolling back"
            );
            ctx.rollback().await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryQueueBroker;
    use serde_json::json;

    fn broker() -> Arc<InMemoryQueueBroker> {
        Arc::new(InMemoryQueueBroker::new())
    }

    #[test]
    fn test_register_requires_handler() {
        let registry = Registry::new();
        let err = TaskDefinition::<u32, u32>::new("square")
            .register(&registry, broker())
            .unwrap_err();
        assert!(matches!(err, JobflowError::Configuration(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_validates_before_enqueue() {
        let registry = Registry::new();
        let broker = broker();
        let handle = TaskDefinition::<u32, u32>::new("square")
            .input_schema(Schema::new().rule("must be positive", |n: &u32| *n > 0))
            .handler(|n, _| async move { Ok(n * n) })
            .register(&registry, broker.clone())
            .unwrap();

        let err = handle.dispatch(&0, None).await.unwrap_err();
        assert!(matches!(err, JobflowError::Validation(_)));
        assert_eq!(broker.submitted_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_uses_child_job_id_and_trace() {
        let registry = Registry::new();
        let broker = broker();
        let handle = TaskDefinition::<u32, u32>::new("square")
            .handler(|n, _| async move { Ok(n * n) })
            .register(&registry, broker.clone())
            .unwrap();

        let job = handle.dispatch(&3, Some(TraceId::from("t-9"))).await.unwrap();
        assert!(job.job_id().starts_with("square:t-9:"));
        assert_eq!(job.trace_id().as_str(), "t-9");

        let claimed = broker.claim("square").await.unwrap().unwrap();
        assert_eq!(claimed.payload, json!({"input": 3, "traceId": "t-9"}));
    }

    #[tokio::test]
    async fn test_processor_runs_handler_and_rolls_back_on_error() {
        let registry = Registry::new();
        let rolled_back = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&rolled_back);
        TaskDefinition::<u32, u32>::new("fragile")
            .handler(move |n, ctx| {
                let log = Arc::clone(&log);
                async move {
                    for step in 0..n {
                        let log = Arc::clone(&log);
                        ctx.on_rollback(move || async move {
                            log.lock().push(step);
                            Ok(())
                        });
                    }
                    anyhow::bail!("failed after {n} steps")
                }
            })
            .register(&registry, broker())
            .unwrap();

        let processor = Arc::clone(&registry.get("fragile").unwrap().processor);
        let err = processor
            .process(JobExecution {
                queue_name: "fragile".into(),
                job_id: "fragile:t:00000000".into(),
                attempt: 1,
                max_attempts: 1,
                data: json!({"input": 3, "traceId": "t"}),
                children_values: Arc::default(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, JobflowError::Handler { .. }));
        assert_eq!(*rolled_back.lock(), vec![2, 1, 0]);
    }
}
