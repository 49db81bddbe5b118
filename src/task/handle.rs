use std::fmt;

use tokio::sync::oneshot;
use tracing::debug;

use super::Payload;
use crate::error::{JobflowError, JobflowResult};
use crate::job::JobOutcome;
use crate::schema::{decode_optional, Schema};
use crate::trace::TraceId;

/// Caller-side handle of one dispatched job.
///
/// The completion watcher is attached before the job is submitted, so
/// `wait` can't miss the outcome. Dropping the handle without waiting is
/// fine; the job still runs.
pub struct JobHandle<O> {
    job_id: String,
    queue_name: String,
    trace_id: TraceId,
    outcome: oneshot::Receiver<JobOutcome>,
    output_schema: Option<Schema<O>>,
}

impl<O> fmt::Debug for JobHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("queue_name", &self.queue_name)
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

impl<O: Payload> JobHandle<O> {
    pub(crate) fn new(
        job_id: String,
        queue_name: String,
        trace_id: TraceId,
        outcome: oneshot::Receiver<JobOutcome>,
        output_schema: Option<Schema<O>>,
    ) -> Self {
        Self {
            job_id,
            queue_name,
            trace_id,
            outcome,
            output_schema,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Suspend until the job reaches a terminal state.
    ///
    /// The return value is validated against the output schema when one is
    /// configured; a terminal failure becomes [`JobflowError::JobFailed`].
    pub async fn wait(self) -> JobflowResult<O> {
        match self.outcome.await {
            Ok(JobOutcome::Completed(value)) => {
                debug!(job_id = %self.job_id, "Job completed");
                decode_optional(self.output_schema.as_ref(), value)
            }
            Ok(JobOutcome::Failed { reason, .. }) => {
                Err(JobflowError::job_failed(self.job_id, reason))
            }
            Err(_) => Err(JobflowError::dispatch(format!(
                "broker dropped the completion watcher of {}",
                self.job_id
            ))),
        }
    }
}
