//! # Workflow Orchestrator
//!
//! A workflow is a barrier handler plus a dependency builder. On dispatch the
//! builder produces the children (task or workflow child specs, recursively),
//! the whole tree is submitted to the broker as one atomic flow, and the
//! barrier runs once every child in its subtree has completed.
//!
//! ```text
//! reindex:root:{trace}
//! ├── parse:{trace}:1a2b3c4d
//! └── index:{trace}:5e6f7a8b        (sub-workflow)
//!     ├── embed:{trace}:0c1d2e3f
//!     └── embed:{trace}:4a5b6c7d
//! ```
//!
//! A child that fails terminally fails its parent chain up to the root; the
//! barrier handlers above it never run, and `wait` on the root handle
//! rejects. Siblings that already completed are not compensated.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::broker::QueueBroker;
use crate::constants::defaults;
use crate::error::{JobflowError, JobflowResult};
use crate::job::{ChildSpec, JobData, JobOptions};
use crate::logging::{log_error, log_job_operation};
use crate::middleware::JobExecution;
use crate::registry::{JobKind, JobProcessor, RegisteredJob, Registry};
use crate::schema::{decode_optional, encode_optional, Schema};
use crate::task::{invoke_handler, BarrierContext, ChildResult, JobHandle, Payload, TaskContext};
use crate::trace::{child_job_id, root_job_id, TraceId};

/// Passed to a dependency builder.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub trace_id: TraceId,
}

impl BuildContext {
    /// The trace id in the form `as_child_spec` takes it.
    pub fn trace(&self) -> Option<TraceId> {
        Some(self.trace_id.clone())
    }
}

type DependencyBuilder<I> =
    Arc<dyn Fn(&I, &BuildContext) -> JobflowResult<Vec<ChildSpec>> + Send + Sync>;

type BarrierHandler<I, O> =
    Arc<dyn Fn(I, BarrierContext) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;

pub struct WorkflowDefinition<I, O> {
    name: String,
    input_schema: Schema<I>,
    output_schema: Option<Schema<O>>,
    dependencies: Option<DependencyBuilder<I>>,
    handler: Option<BarrierHandler<I, O>>,
    concurrency: Option<usize>,
    attempts: u32,
}

impl<I, O> fmt::Debug for WorkflowDefinition<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl<I: Payload, O: Payload> WorkflowDefinition<I, O> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_schema: Schema::new(),
            output_schema: None,
            dependencies: None,
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

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Attempts of the barrier job itself; children use their own setting.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Children of every invocation. Must be pure with respect to its
    /// arguments and pass `ctx.trace()` to each child's `as_child_spec`.
    pub fn dependencies<F>(mut self, builder: F) -> Self
    where
        F: Fn(&I, &BuildContext) -> JobflowResult<Vec<ChildSpec>> + Send + Sync + 'static,
    {
        self.dependencies = Some(Arc::new(builder));
        self
    }

    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(I, BarrierContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |input, ctx| handler(input, ctx).boxed()));
        self
    }

    pub fn register(
        self,
        registry: &Registry,
        broker: Arc<dyn QueueBroker>,
    ) -> JobflowResult<WorkflowHandle<I, O>> {
        let handler = self.handler.ok_or_else(|| {
            JobflowError::configuration(format!("workflow '{}' has no handler", self.name))
        })?;
        let dependencies = self
            .dependencies
            .unwrap_or_else(|| Arc::new(no_dependencies::<I>));

        registry.register(RegisteredJob {
            name: self.name.clone(),
            kind: JobKind::Workflow,
            concurrency: self.concurrency,
            processor: Arc::new(BarrierProcessor {
                name: self.name.clone(),
                input_schema: self.input_schema.clone(),
                output_schema: self.output_schema.clone(),
                handler,
            }),
        })?;

        Ok(WorkflowHandle {
            shared: Arc::new(WorkflowShared {
                name: self.name,
                input_schema: self.input_schema,
                output_schema: self.output_schema,
                dependencies,
                attempts: self.attempts,
                broker,
            }),
        })
    }
}

fn no_dependencies<I>(_: &I, _: &BuildContext) -> JobflowResult<Vec<ChildSpec>> {
    Ok(Vec::new())
}

struct WorkflowShared<I, O> {
    name: String,
    input_schema: Schema<I>,
    output_schema: Option<Schema<O>>,
    dependencies: DependencyBuilder<I>,
    attempts: u32,
    broker: Arc<dyn QueueBroker>,
}

pub struct WorkflowHandle<I, O> {
    shared: Arc<WorkflowShared<I, O>>,
}

impl<I, O> Clone for WorkflowHandle<I, O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<I, O> fmt::Debug for WorkflowHandle<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("name", &self.shared.name)
            .finish()
    }
}

impl<I: Payload, O: Payload> WorkflowHandle<I, O> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Build the tree and submit it as one flow rooted at `{name}:root:{traceId}`.
    pub async fn dispatch(
        &self,
        input: &I,
        trace_id: Option<TraceId>,
    ) -> JobflowResult<JobHandle<O>> {
        let trace_id = TraceId::resolve(trace_id)?;
        let job_id = root_job_id(&self.shared.name, &trace_id);
        let flow = self.build_tree(input, &trace_id, job_id.clone())?;
        let nodes = flow.job_ids().len();

        let outcome = self.shared.broker.watch(&self.shared.name, &job_id);
        if let Err(e) = self.shared.broker.add_flow(flow).await {
            drop(outcome);
            self.shared.broker.unwatch(&self.shared.name, &job_id);
            log_error("workflow_orchestrator", "dispatch", &e.to_string(), Some(&job_id));
            return Err(e.into());
        }

        let details = format!("nodes={nodes}");
        log_job_operation(
            "dispatch",
            &self.shared.name,
            Some(&job_id),
            Some(trace_id.as_str()),
            "submitted",
            Some(&details),
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

    /// This workflow as a node of a parent's tree, with a child-style job id.
    pub fn as_child_spec(&self, input: &I, trace_id: Option<TraceId>) -> JobflowResult<ChildSpec> {
        let trace_id = TraceId::resolve(trace_id)?;
        let job_id = child_job_id(&self.shared.name, &trace_id);
        self.build_tree(input, &trace_id, job_id)
    }

    fn build_tree(&self, input: &I, trace_id: &TraceId, job_id: String) -> JobflowResult<ChildSpec> {
        let encoded = self.shared.input_schema.encode(input)?;
        let ctx = BuildContext {
            trace_id: trace_id.clone(),
        };
        let children = (self.shared.dependencies)(input, &ctx)?;

        if let Some(stray) = children.iter().find(|c| c.trace_id() != trace_id) {
            return Err(JobflowError::validation(format!(
                "child {} of workflow {} carries trace {} instead of {}",
                stray.job_id(),
                self.shared.name,
                stray.trace_id(),
                trace_id
            )));
        }

        debug!(
            workflow = %self.shared.name,
            job_id = %job_id,
            children = children.len(),
            "Built workflow tree"
        );
        Ok(ChildSpec {
            name: self.shared.name.clone(),
            queue_name: self.shared.name.clone(),
            data: JobData::new(encoded, trace_id.clone()),
            children,
            options: JobOptions::new(job_id).with_attempts(self.shared.attempts),
        })
    }
}

impl<I: Payload, O: Payload> ChildResult for WorkflowHandle<I, O> {
    type Output = O;

    fn child_name(&self) -> &str {
        &self.shared.name
    }

    fn decode_result(&self, value: Value) -> JobflowResult<O> {
        decode_optional(self.shared.output_schema.as_ref(), value)
    }
}

/// Worker-side execution of a barrier job.
struct BarrierProcessor<I, O> {
    name: String,
    input_schema: Schema<I>,
    output_schema: Option<Schema<O>>,
    handler: BarrierHandler<I, O>,
}

#[async_trait]
impl<I: Payload, O: Payload> JobProcessor for BarrierProcessor<I, O> {
    async fn process(&self, execution: JobExecution) -> JobflowResult<Value> {
        let data = JobData::from_value(execution.data)?;
        let input = self.input_schema.parse(data.input)?;
        let task = TaskContext::new(
            data.trace_id,
            execution.job_id,
            self.name.clone(),
            execution.attempt,
        );
        let ctx = BarrierContext::new(task.clone(), execution.children_values);

        let handler = Arc::clone(&self.handler);
        let result = invoke_handler(&self.name, move || handler(input, ctx))
            .await
            .and_then(|output| encode_optional(self.output_schema.as_ref(), &output));

        if result.is_err() {
            // Only the barrier's own compensations; children keep their effects.
            task.rollback().await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryQueueBroker;
    use crate::task::TaskDefinition;

    #[tokio::test]
    async fn test_dispatch_submits_whole_tree() {
        let registry = Registry::new();
        let broker = Arc::new(InMemoryQueueBroker::new());
        let leaf = TaskDefinition::<u32, u32>::new("leaf")
            .handler(|n, _| async move { Ok(n) })
            .register(&registry, broker.clone())
            .unwrap();

        let child_leaf = leaf.clone();
        let workflow = WorkflowDefinition::<u32, u32>::new("sum")
            .dependencies(move |n, ctx| {
                (0..*n)
                    .map(|i| child_leaf.as_child_spec(&i, ctx.trace()))
                    .collect()
            })
            .handler(|_, _| async { Ok(0) })
            .register(&registry, broker.clone())
            .unwrap();

        let handle = workflow
            .dispatch(&3, Some(TraceId::from("t-1")))
            .await
            .unwrap();
        assert_eq!(handle.job_id(), "sum:root:t-1");
        assert_eq!(broker.submitted_count(), 4);
        assert_eq!(broker.ready_len("leaf"), 3);
        assert_eq!(broker.ready_len("sum"), 0);
    }

    #[tokio::test]
    async fn test_children_must_share_trace() {
        let registry = Registry::new();
        let broker = Arc::new(InMemoryQueueBroker::new());
        let leaf = TaskDefinition::<u32, u32>::new("leaf")
            .handler(|n, _| async move { Ok(n) })
            .register(&registry, broker.clone())
            .unwrap();

        let workflow = WorkflowDefinition::<u32, u32>::new("careless")
            .dependencies(move |n, _| Ok(vec![leaf.as_child_spec(n, None)?]))
            .handler(|_, _| async { Ok(0) })
            .register(&registry, broker.clone())
            .unwrap();

        let err = workflow.dispatch(&1, None).await.unwrap_err();
        assert!(matches!(err, JobflowError::Validation(_)));
        assert_eq!(broker.submitted_count(), 0);
    }

    #[tokio::test]
    async fn test_as_child_spec_uses_child_style_id() {
        let registry = Registry::new();
        let broker = Arc::new(InMemoryQueueBroker::new());
        let workflow = WorkflowDefinition::<u32, u32>::new("index")
            .handler(|n, _| async move { Ok(n) })
            .register(&registry, broker)
            .unwrap();

        let spec = workflow
            .as_child_spec(&1, Some(TraceId::from("t-2")))
            .unwrap();
        assert!(spec.job_id().starts_with("index:t-2:"));
        assert!(spec.children.is_empty());
    }
}
