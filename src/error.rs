//! # Error Types
//!
//! Structured error handling for the job orchestration core. Every failure a
//! caller can observe is a [`JobflowError`]; collaborator errors (broker,
//! pub/sub, record store) convert into it through `From`.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::pubsub::PubSubError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobflowError {
    /// Input or output failed its schema check. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Business logic returned an error.
    #[error("Handler error in {task_name}: {message}")]
    Handler { task_name: String, message: String },

    /// The broker or pub/sub transport rejected a submission.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// An event arrived on a run's channel that does not follow the chunk protocol.
    #[error("Aggregation protocol error: {0}")]
    AggregationProtocol(String),

    /// A compensation failed. Logged, never the reported cause of a run.
    #[error("Rollback error: {0}")]
    Rollback(String),

    #[error("Lifecycle hook error: {0}")]
    LifecycleHook(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A dispatched job reached a terminal failure.
    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("Chunk {chunk_index} failed: {message}")]
    ChunkFailed { chunk_index: usize, message: String },

    #[error("No result for child {child} in trace {trace_id}")]
    MissingChildResult { child: String, trace_id: String },

    #[error("Middleware error: {0}")]
    Middleware(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl JobflowError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn handler(task_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            task_name: task_name.into(),
            message: message.into(),
        }
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::AggregationProtocol(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn job_failed(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::JobFailed {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the broker's retry policy may apply to this failure.
    ///
    /// Schema, configuration and protocol violations fail the same way on every
    /// attempt, so retrying them only delays the inevitable.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_)
                | Self::Configuration(_)
                | Self::AggregationProtocol(_)
                | Self::Middleware(_)
        )
    }
}

impl From<serde_json::Error> for JobflowError {
    fn from(error: serde_json::Error) -> Self {
        JobflowError::Validation(format!("JSON serialization error: {error}"))
    }
}

impl From<BrokerError> for JobflowError {
    fn from(error: BrokerError) -> Self {
        JobflowError::Dispatch(error.to_string())
    }
}

impl From<PubSubError> for JobflowError {
    fn from(error: PubSubError) -> Self {
        JobflowError::Dispatch(error.to_string())
    }
}

impl From<StoreError> for JobflowError {
    fn from(error: StoreError) -> Self {
        JobflowError::Store(error.to_string())
    }
}

impl From<config::ConfigError> for JobflowError {
    fn from(error: config::ConfigError) -> Self {
        JobflowError::Configuration(error.to_string())
    }
}

pub type JobflowResult<T> = std::result::Result<T, JobflowError>;
