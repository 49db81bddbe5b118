//! # Job Registry
//!
//! Explicit, process-scoped table of executable units. A registry is built
//! once, passed by reference to every definition's `register`, and read by
//! the worker runtime to decide which queues to serve.
//!
//! Registration is where configuration mistakes surface: an invalid or
//! duplicate name fails `register` with [`JobflowError::Configuration`], never
//! a later dispatch.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

use crate::constants::{CHUNK_ID_SEPARATOR, JOB_ID_SEPARATOR};
use crate::error::{JobflowError, JobflowResult};
use crate::middleware::JobExecution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Task,
    Workflow,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Workflow => write!(f, "workflow"),
        }
    }
}

/// Worker-side execution of one job of a registered queue.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, execution: JobExecution) -> JobflowResult<Value>;
}

pub struct RegisteredJob {
    pub name: String,
    pub kind: JobKind,
    /// `None` falls back to `worker.default_concurrency`.
    pub concurrency: Option<usize>,
    pub processor: Arc<dyn JobProcessor>,
}

impl fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Names double as queue names and job id prefixes.
pub fn validate_name(name: &str) -> JobflowResult<()> {
    if name.trim().is_empty() {
        return Err(JobflowError::configuration("name must not be empty"));
    }
    if name.contains(JOB_ID_SEPARATOR) || name.contains(CHUNK_ID_SEPARATOR) {
        return Err(JobflowError::configuration(format!(
            "name '{name}' must not contain '{JOB_ID_SEPARATOR}' or '{CHUNK_ID_SEPARATOR}'"
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct Registry {
    jobs: DashMap<String, Arc<RegisteredJob>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("jobs", &self.list())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: RegisteredJob) -> JobflowResult<Arc<RegisteredJob>> {
        validate_name(&job.name)?;
        if job.concurrency == Some(0) {
            return Err(JobflowError::configuration(format!(
                "{} '{}' has zero concurrency",
                job.kind, job.name
            )));
        }

        match self.jobs.entry(job.name.clone()) {
            Entry::Occupied(existing) => Err(JobflowError::configuration(format!(
                "{} '{}' is already registered as a {}",
                job.kind,
                job.name,
                existing.get().kind
            ))),
            Entry::Vacant(slot) => {
                let job = Arc::new(job);
                slot.insert(Arc::clone(&job));
                info!(name = %job.name, kind = %job.kind, "📚 Registered job");
                Ok(job)
            }
        }
    }

    pub fn get(&self, name: &str) -> JobflowResult<Arc<RegisteredJob>> {
        self.jobs
            .get(name)
            .map(|job| Arc::clone(job.value()))
            .ok_or_else(|| JobflowError::configuration(format!("no job registered as '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn jobs(&self) -> Vec<Arc<RegisteredJob>> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl JobProcessor for Echo {
        async fn process(&self, execution: JobExecution) -> JobflowResult<Value> {
            Ok(execution.data)
        }
    }

    fn job(name: &str, kind: JobKind) -> RegisteredJob {
        RegisteredJob {
            name: name.to_string(),
            kind,
            concurrency: None,
            processor: Arc::new(Echo),
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = Registry::new();
        registry.register(job("embed", JobKind::Task)).unwrap();
        registry.register(job("reindex", JobKind::Workflow)).unwrap();

        assert_eq!(registry.get("embed").unwrap().kind, JobKind::Task);
        assert_eq!(registry.list(), vec!["embed", "reindex"]);
        assert!(matches!(
            registry.get("missing"),
            Err(JobflowError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_name_fails_at_registration() {
        let registry = Registry::new();
        registry.register(job("embed", JobKind::Task)).unwrap();
        let err = registry.register(job("embed", JobKind::Workflow)).unwrap_err();
        assert!(matches!(err, JobflowError::Configuration(ref m) if m.contains("already registered")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("a:b").is_err());
        assert!(validate_name("a&b").is_err());
        assert!(validate_name("re-embed_v2").is_ok());
    }
}
