//! # Trace Identifiers and Job Naming
//!
//! A [`TraceId`] is created once per top-level invocation and copied verbatim
//! into every descendant job's payload. All jobs sharing a trace id belong to
//! exactly one logical execution.
//!
//! Job ids follow fixed conventions that other tooling parses:
//!
//! ```text
//! child job        {name}:{traceId}:{8-hex-suffix}
//! workflow root    {name}:root:{traceId}
//! chunk job        {distributedTaskId}&{chunkIndex}
//! run channel      {runId}:events
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    CHILD_SUFFIX_LEN, CHUNK_ID_SEPARATOR, EVENTS_CHANNEL_SUFFIX, JOB_ID_SEPARATOR, ROOT_SEGMENT,
};
use crate::error::{JobflowError, JobflowResult};

/// Correlation identifier shared by all jobs of one logical invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Generate a fresh random trace id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Use the caller's trace id, or generate one when absent.
    ///
    /// A supplied id must be non-empty and free of job id separators, since
    /// child results are matched on `:{name}:{traceId}:` boundaries.
    pub fn resolve(trace_id: Option<TraceId>) -> JobflowResult<Self> {
        match trace_id {
            Some(trace_id) => {
                trace_id.validate()?;
                Ok(trace_id)
            }
            None => Ok(Self::generate()),
        }
    }

    pub fn validate(&self) -> JobflowResult<()> {
        if self.0.trim().is_empty() {
            return Err(JobflowError::validation("trace id must not be empty"));
        }
        if self.0.contains(JOB_ID_SEPARATOR) || self.0.contains(CHUNK_ID_SEPARATOR) {
            return Err(JobflowError::validation(format!(
                "trace id '{}' must not contain '{JOB_ID_SEPARATOR}' or '{CHUNK_ID_SEPARATOR}'",
                self.0
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TraceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TraceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Random lowercase hex suffix that keeps repeated child invocations apart.
pub fn random_suffix() -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(CHILD_SUFFIX_LEN);
    hex
}

/// `{name}:{traceId}:{8-hex-suffix}`
pub fn child_job_id(name: &str, trace_id: &TraceId) -> String {
    format!(
        "{name}{sep}{trace_id}{sep}{suffix}",
        sep = JOB_ID_SEPARATOR,
        suffix = random_suffix()
    )
}

/// `{name}:root:{traceId}`
pub fn root_job_id(name: &str, trace_id: &TraceId) -> String {
    format!("{name}{sep}{ROOT_SEGMENT}{sep}{trace_id}", sep = JOB_ID_SEPARATOR)
}

/// `{distributedTaskId}&{chunkIndex}`
pub fn chunk_job_id(distributed_task_id: &Uuid, chunk_index: usize) -> String {
    format!("{distributed_task_id}{CHUNK_ID_SEPARATOR}{chunk_index}")
}

/// `{runId}:events`
pub fn events_channel(run_id: &str) -> String {
    format!("{run_id}{JOB_ID_SEPARATOR}{EVENTS_CHANNEL_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_job_id_shape() {
        let trace = TraceId::from("t-1");
        let id = child_job_id("embed", &trace);
        let parts: Vec<&str> = id.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "embed");
        assert_eq!(parts[1], "t-1");
        assert_eq!(parts[2].len(), CHILD_SUFFIX_LEN);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_child_job_ids_are_unique() {
        let trace = TraceId::generate();
        assert_ne!(child_job_id("embed", &trace), child_job_id("embed", &trace));
    }

    #[test]
    fn test_root_and_chunk_ids() {
        let trace = TraceId::from("abc");
        assert_eq!(root_job_id("reindex", &trace), "reindex:root:abc");

        let task_id = Uuid::nil();
        assert_eq!(
            chunk_job_id(&task_id, 7),
            "00000000-0000-0000-0000-000000000000&7"
        );
        assert_eq!(events_channel("run-1"), "run-1:events");
    }

    #[test]
    fn test_trace_id_serializes_as_plain_string() {
        let trace = TraceId::from("xyz");
        assert_eq!(serde_json::to_value(&trace).unwrap(), serde_json::json!("xyz"));
        assert_eq!(TraceId::resolve(Some(trace.clone())).unwrap(), trace);
    }

    #[test]
    fn test_supplied_trace_ids_may_not_contain_separators() {
        for bad in ["a:b", "run&1", "", "  "] {
            let err = TraceId::resolve(Some(TraceId::from(bad))).unwrap_err();
            assert!(matches!(err, JobflowError::Validation(_)), "{bad:?} accepted");
        }
        assert!(TraceId::resolve(None).unwrap().validate().is_ok());
    }
}
