//! Execution contexts handed to handlers.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::rollback::{RollbackStack, RollbackSummary};
use crate::correlation::find_child_results;
use crate::error::{JobflowError, JobflowResult};
use crate::trace::TraceId;

/// Something whose results can appear among a barrier's children values:
/// task handles and workflow handles.
pub trait ChildResult {
    type Output;

    /// Task or workflow name, which is also the first job id segment.
    fn child_name(&self) -> &str;

    fn decode_result(&self, value: Value) -> JobflowResult<Self::Output>;
}

/// Context of one task handler invocation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    trace_id: TraceId,
    job_id: String,
    task_name: String,
    attempt: u32,
    rollback: RollbackStack,
}

impl TaskContext {
    pub fn new(
        trace_id: TraceId,
        job_id: impl Into<String>,
        task_name: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            trace_id,
            job_id: job_id.into(),
            task_name: task_name.into(),
            attempt,
            rollback: RollbackStack::new(),
        }
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Register a compensation for a side effect this invocation performed.
    pub fn on_rollback<F, Fut>(&self, compensation: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.rollback.push(compensation);
    }

    pub fn pending_rollbacks(&self) -> usize {
        self.rollback.len()
    }

    pub(crate) async fn rollback(&self) -> RollbackSummary {
        self.rollback.drain(&self.task_name, &self.job_id).await
    }
}

/// Context of a workflow barrier: a [`TaskContext`] plus the children's results.
#[derive(Debug, Clone)]
pub struct BarrierContext {
    task: TaskContext,
    children_values: Arc<HashMap<String, Value>>,
}

impl BarrierContext {
    pub fn new(task: TaskContext, children_values: Arc<HashMap<String, Value>>) -> Self {
        Self {
            task,
            children_values,
        }
    }

    /// Every result `child` produced within this trace, sorted by job key.
    ///
    /// A child invoked twice in the tree yields two results. No match at all
    /// is [`JobflowError::MissingChildResult`].
    pub fn get_task_result<C>(&self, child: &C) -> JobflowResult<Vec<C::Output>>
    where
        C: ChildResult,
    {
        let matches = find_child_results(
            &self.children_values,
            child.child_name(),
            self.task.trace_id(),
        );
        if matches.is_empty() {
            return Err(JobflowError::MissingChildResult {
                child: child.child_name().to_string(),
                trace_id: self.task.trace_id().to_string(),
            });
        }

        debug!(
            child = %child.child_name(),
            trace_id = %self.task.trace_id(),
            results = matches.len(),
            "Collected child results"
        );
        matches
            .into_iter()
            .map(|(_, value)| child.decode_result(value.clone()))
            .collect()
    }

    pub fn children_values(&self) -> &HashMap<String, Value> {
        &self.children_values
    }

    pub fn task(&self) -> &TaskContext {
        &self.task
    }
}

impl Deref for BarrierContext {
    type Target = TaskContext;

    fn deref(&self) -> &Self::Target {
        &self.task
    }
}
