//! # Queue Broker Contract
//!
//! Provider-agnostic contract for the durable queue the orchestration core
//! runs on. A broker must offer:
//!
//! - at-least-once delivery with per-`jobId` deduplication
//! - atomic submission of a dependency tree (flow) where a parent is only
//!   handed to a worker once every child has completed
//! - completion watchers that can be attached before a job is submitted
//! - a lifecycle event stream (`active`/`completed`/`failed`/`error`)
//!
//! [`InMemoryQueueBroker`] implements the contract for tests, development and
//! single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Notify};

use crate::job::{ChildSpec, ClaimedJob, JobEvent, JobFailure, JobOutcome, JobRequest};

pub mod memory;

pub use memory::InMemoryQueueBroker;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker unavailable: {message}")]
    Unavailable { message: String },

    #[error("Job not found: {queue_name}/{job_id}")]
    JobNotFound { queue_name: String, job_id: String },

    #[error("Job {job_id} in {queue_name} is not active")]
    JobNotActive { queue_name: String, job_id: String },

    #[error("Invalid flow: {message}")]
    InvalidFlow { message: String },
}

impl BrokerError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn job_not_found(queue_name: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            queue_name: queue_name.into(),
            job_id: job_id.into(),
        }
    }

    pub fn invalid_flow(message: impl Into<String>) -> Self {
        Self::InvalidFlow {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait QueueBroker: Send + Sync + 'static {
    /// Create a queue if it doesn't exist (idempotent).
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), BrokerError>;

    /// Submit one job. Submitting an id that already exists is a no-op that
    /// returns the existing id.
    async fn enqueue(&self, request: JobRequest) -> Result<String, BrokerError>;

    /// Submit a whole tree atomically; returns the root job id.
    async fn add_flow(&self, flow: ChildSpec) -> Result<String, BrokerError>;

    /// Take the next ready job of `queue_name`, if any, and mark it active.
    async fn claim(&self, queue_name: &str) -> Result<Option<ClaimedJob>, BrokerError>;

    async fn complete(&self, job: &ClaimedJob, return_value: Value) -> Result<(), BrokerError>;

    /// Report a failed attempt. Retryable failures with attempts left are re-queued.
    async fn fail(&self, job: &ClaimedJob, failure: JobFailure) -> Result<(), BrokerError>;

    /// Register interest in a job's terminal outcome.
    ///
    /// Synchronous on purpose: callers attach the watcher before submitting,
    /// so the outcome can't be missed even if the job finishes (and is
    /// removed) immediately.
    fn watch(&self, queue_name: &str, job_id: &str) -> oneshot::Receiver<JobOutcome>;

    /// Drop abandoned watchers of a job whose submission failed. Callers drop
    /// their receiver first; watchers still held by others are kept.
    fn unwatch(&self, queue_name: &str, job_id: &str);

    /// Subscribe to lifecycle events of all queues.
    fn events(&self) -> broadcast::Receiver<JobEvent>;

    /// Publish an `error` lifecycle event for a worker-side problem that
    /// isn't a handler outcome (claim, complete or fail calls that failed).
    fn report_error(&self, queue_name: &str, job_id: &str, message: &str);

    /// Wake-up signal fired when `queue_name` gains a ready job.
    fn notifier(&self, queue_name: &str) -> Arc<Notify>;

    /// Provider name for logging.
    fn provider_name(&self) -> &'static str;
}
