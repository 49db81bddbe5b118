//! # Job Types
//!
//! Wire-level types shared by the task facade, the workflow orchestrator, the
//! worker runtime and the broker contract.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::defaults;
use crate::error::{JobflowError, JobflowResult};
use crate::trace::TraceId;

/// Payload of every task and workflow job: the validated input plus the trace id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub input: Value,
    pub trace_id: TraceId,
}

impl JobData {
    pub fn new(input: Value, trace_id: TraceId) -> Self {
        Self { input, trace_id }
    }

    pub fn to_value(&self) -> JobflowResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> JobflowResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| JobflowError::validation(format!("malformed job data: {e}")))
    }
}

/// Broker options attached to one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub job_id: String,
    /// Drop the job record once it completes; watchers and parents still get the value.
    pub remove_on_complete: bool,
    /// Total attempts, including the first one.
    pub attempts: u32,
}

impl JobOptions {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            remove_on_complete: true,
            attempts: defaults::JOB_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn keep_on_complete(mut self) -> Self {
        self.remove_on_complete = false;
        self
    }
}

/// One node of a flow tree; leaves and barriers alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildSpec {
    pub name: String,
    pub queue_name: String,
    pub data: JobData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildSpec>,
    pub options: JobOptions,
}

impl ChildSpec {
    pub fn job_id(&self) -> &str {
        &self.options.job_id
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.data.trace_id
    }

    /// Every job id in this subtree, depth first, this node first.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids = vec![self.options.job_id.clone()];
        for child in &self.children {
            ids.extend(child.job_ids());
        }
        ids
    }
}

/// A single job submission.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub queue_name: String,
    pub payload: Value,
    pub options: JobOptions,
}

impl JobRequest {
    pub fn new(queue_name: impl Into<String>, payload: Value, options: JobOptions) -> Self {
        Self {
            queue_name: queue_name.into(),
            payload,
            options,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.options.job_id
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub queue_name: String,
    pub job_id: String,
    pub payload: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Total attempts the broker allows for this job.
    pub max_attempts: u32,
    /// Raw children values keyed by broker job key; empty for leaves.
    pub children_values: Arc<HashMap<String, Value>>,
}

/// Failure report for a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub reason: String,
    pub stack: Option<String>,
    pub retryable: bool,
}

impl JobFailure {
    pub fn from_error(error: &JobflowError) -> Self {
        Self {
            reason: error.to_string(),
            stack: Some(format!("{error:?}")),
            retryable: error.is_retryable(),
        }
    }
}

/// Terminal outcome delivered to a job watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    Failed { reason: String, stack: Option<String> },
}

/// Queue lifecycle event emitted by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub queue_name: String,
    pub job_id: String,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEventKind {
    Active {
        attempt: u32,
    },
    Completed {
        return_value: Value,
    },
    /// `will_retry` is true when the broker re-queued the job.
    Failed {
        reason: String,
        stack: Option<String>,
        attempt: u32,
        will_retry: bool,
    },
    /// Worker or broker level problem not tied to a handler outcome.
    Error {
        message: String,
    },
}

impl JobEventKind {
    pub fn name(&self) -> &'static str {
        use crate::constants::lifecycle_events::*;
        match self {
            Self::Active { .. } => ACTIVE,
            Self::Completed { .. } => COMPLETED,
            Self::Failed { .. } => FAILED,
            Self::Error { .. } => ERROR,
        }
    }
}
