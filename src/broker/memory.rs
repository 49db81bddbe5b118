//! # In-Memory Queue Broker
//!
//! Thread-safe in-memory implementation of [`QueueBroker`] with flow
//! (parent-waits-for-children) semantics.
//!
//! ## Features
//!
//! - **Deduplication**: submitting an existing job id is a no-op
//! - **Flows**: a tree is inserted under one lock; parents become ready only
//!   when every child completed
//! - **Child failure**: a child that fails terminally fails its parent chain,
//!   so a barrier never runs with a missing child result
//! - **Retries**: retryable failures are re-queued while attempts remain
//! - **Remove on complete**: completed records are dropped after their value
//!   has been handed to watchers and parents
//! - **Failed retention**: failed records stay so late watchers still see the
//!   outcome, until [`InMemoryQueueBroker::purge_failed`] evicts them

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, info, warn};

use super::{BrokerError, QueueBroker};
use crate::config::BrokerConfig;
use crate::constants::defaults;
use crate::correlation::ChildJobKey;
use crate::job::{
    ChildSpec, ClaimedJob, JobEvent, JobEventKind, JobFailure, JobOptions, JobOutcome, JobRequest,
};

/// Observable state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    WaitingChildren,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug)]
struct JobRecord {
    queue_name: String,
    job_id: String,
    payload: Value,
    options: JobOptions,
    state: JobState,
    attempts_made: u32,
    parent_key: Option<String>,
    pending_children: usize,
    children_values: HashMap<String, Value>,
    return_value: Option<Value>,
    failed_reason: Option<String>,
}

impl JobRecord {
    fn new(queue_name: &str, payload: Value, options: JobOptions, parent_key: Option<String>) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            job_id: options.job_id.clone(),
            payload,
            options,
            state: JobState::Waiting,
            attempts_made: 0,
            parent_key,
            pending_children: 0,
            children_values: HashMap::new(),
            return_value: None,
            failed_reason: None,
        }
    }

    fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Completed => Some(JobOutcome::Completed(
                self.return_value.clone().unwrap_or(Value::Null),
            )),
            JobState::Failed => Some(JobOutcome::Failed {
                reason: self.failed_reason.clone().unwrap_or_default(),
                stack: None,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    jobs: HashMap<String, JobRecord>,
    ready: HashMap<String, VecDeque<String>>,
    queues: HashSet<String>,
    watchers: HashMap<String, Vec<oneshot::Sender<JobOutcome>>>,
}

impl BrokerState {
    fn resolve_watchers(&mut self, key: &str, outcome: &JobOutcome) {
        if let Some(watchers) = self.watchers.remove(key) {
            for watcher in watchers {
                // A dropped receiver just means nobody is waiting anymore.
                let _ = watcher.send(outcome.clone());
            }
        }
    }

    fn push_ready(&mut self, queue_name: &str, key: String) {
        self.ready
            .entry(queue_name.to_string())
            .or_default()
            .push_back(key);
    }
}

/// In-memory [`QueueBroker`].
///
/// # Example
///
/// ```rust
/// use jobflow::broker::{InMemoryQueueBroker, QueueBroker};
/// use jobflow::job::{JobOptions, JobRequest};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryQueueBroker::new();
/// broker
///     .enqueue(JobRequest::new("embed", serde_json::json!({}), JobOptions::new("embed:t:1")))
///     .await?;
/// let job = broker.claim("embed").await?.expect("job is ready");
/// broker.complete(&job, serde_json::json!({"ok": true})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryQueueBroker {
    key_prefix: String,
    state: Mutex<BrokerState>,
    events: broadcast::Sender<JobEvent>,
    notifiers: DashMap<String, Arc<Notify>>,
    available: AtomicBool,
    submitted: AtomicU64,
}

impl Default for InMemoryQueueBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueBroker {
    pub fn new() -> Self {
        Self::with_config(&BrokerConfig::default(), defaults::EVENT_BROADCAST_BUFFER)
    }

    pub fn with_config(config: &BrokerConfig, event_buffer_size: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer_size.max(1));
        Self {
            key_prefix: config.key_prefix.clone(),
            state: Mutex::new(BrokerState::default()),
            events,
            notifiers: DashMap::new(),
            available: AtomicBool::new(true),
            submitted: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: submissions fail with [`BrokerError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of jobs accepted by `enqueue` and `add_flow` (flow nodes counted individually).
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Current state of a job, `None` once removed (or never submitted).
    pub fn job_state(&self, queue_name: &str, job_id: &str) -> Option<JobState> {
        let key = self.job_key(queue_name, job_id);
        self.state.lock().jobs.get(&key).map(|r| r.state)
    }

    /// Ready jobs waiting in `queue_name`.
    pub fn ready_len(&self, queue_name: &str) -> usize {
        self.state
            .lock()
            .ready
            .get(queue_name)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Watchers waiting on a terminal outcome, across all jobs.
    pub fn watcher_count(&self) -> usize {
        self.state.lock().watchers.values().map(Vec::len).sum()
    }

    /// Evict failed records whose flow has no live ancestor left; returns how
    /// many were removed.
    pub fn purge_failed(&self) -> usize {
        let mut state = self.state.lock();
        let removable: Vec<String> = state
            .jobs
            .iter()
            .filter(|(_, record)| record.state == JobState::Failed)
            .filter(|(_, record)| {
                record
                    .parent_key
                    .as_ref()
                    .and_then(|parent| state.jobs.get(parent))
                    .map_or(true, |parent| parent.state.is_terminal())
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &removable {
            state.jobs.remove(key);
            state.watchers.remove(key);
        }
        if !removable.is_empty() {
            debug!(removed = removable.len(), "Purged failed jobs");
        }
        removable.len()
    }

    /// Raw key used in children-values maps: `{prefix}:{queue}:{jobId}`.
    pub fn job_key(&self, queue_name: &str, job_id: &str) -> String {
        ChildJobKey::format(&self.key_prefix, queue_name, job_id)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::unavailable("in-memory broker marked unavailable"))
        }
    }

    fn emit(&self, queue_name: &str, job_id: &str, kind: JobEventKind) {
        // No receivers is fine; the event stream is observability only.
        let _ = self.events.send(JobEvent {
            queue_name: queue_name.to_string(),
            job_id: job_id.to_string(),
            kind,
        });
    }

    fn wake(&self, queue_names: impl IntoIterator<Item = String>) {
        for queue_name in queue_names {
            self.notifier(&queue_name).notify_one();
        }
    }

    fn insert_flow_node(
        &self,
        state: &mut BrokerState,
        node: &ChildSpec,
        parent_key: Option<String>,
        woken: &mut HashSet<String>,
    ) -> Result<(), BrokerError> {
        let key = self.job_key(&node.queue_name, node.job_id());
        let payload = node
            .data
            .to_value()
            .map_err(|e| BrokerError::invalid_flow(e.to_string()))?;

        let mut record = JobRecord::new(
            &node.queue_name,
            payload,
            node.options.clone(),
            parent_key,
        );
        state.queues.insert(node.queue_name.clone());

        if node.children.is_empty() {
            state.push_ready(&node.queue_name, key.clone());
            woken.insert(node.queue_name.clone());
        } else {
            record.state = JobState::WaitingChildren;
            record.pending_children = node.children.len();
        }
        state.jobs.insert(key.clone(), record);

        for child in &node.children {
            self.insert_flow_node(state, child, Some(key.clone()), woken)?;
        }
        Ok(())
    }

    /// Fail every non-terminal ancestor of `child_key`.
    fn fail_parents(&self, state: &mut BrokerState, child_key: &str, reason: &str) {
        let mut current_child = child_key.to_string();
        let mut parent_key = state
            .jobs
            .get(child_key)
            .and_then(|r| r.parent_key.clone());

        while let Some(key) = parent_key {
            let Some(parent) = state.jobs.get_mut(&key) else {
                break;
            };
            if parent.state.is_terminal() {
                break;
            }

            let parent_reason = format!("child job {current_child} failed: {reason}");
            parent.state = JobState::Failed;
            parent.failed_reason = Some(parent_reason.clone());
            let queue_name = parent.queue_name.clone();
            let job_id = parent.job_id.clone();
            let attempt = parent.attempts_made;
            let next = parent.parent_key.clone();

            warn!(
                queue_name = %queue_name,
                job_id = %job_id,
                failed_child = %current_child,
                "Failing parent job after child failure"
            );
            self.emit(
                &queue_name,
                &job_id,
                JobEventKind::Failed {
                    reason: parent_reason.clone(),
                    stack: None,
                    attempt,
                    will_retry: false,
                },
            );
            state.resolve_watchers(
                &key,
                &JobOutcome::Failed {
                    reason: parent_reason,
                    stack: None,
                },
            );

            current_child = key;
            parent_key = next;
        }
    }
}

fn collect_flow_keys(
    broker: &InMemoryQueueBroker,
    node: &ChildSpec,
    keys: &mut Vec<String>,
) {
    keys.push(broker.job_key(&node.queue_name, node.job_id()));
    for child in &node.children {
        collect_flow_keys(broker, child, keys);
    }
}

#[async_trait]
impl QueueBroker for InMemoryQueueBroker {
    async fn ensure_queue(&self, queue_name: &str) -> Result<(), BrokerError> {
        self.state.lock().queues.insert(queue_name.to_string());
        Ok(())
    }

    async fn enqueue(&self, request: JobRequest) -> Result<String, BrokerError> {
        self.check_available()?;

        let key = self.job_key(&request.queue_name, request.job_id());
        let job_id = request.job_id().to_string();
        {
            let mut state = self.state.lock();
            if state.jobs.contains_key(&key) {
                debug!(job_id = %job_id, "Duplicate job id, keeping existing job");
                return Ok(job_id);
            }
            state.queues.insert(request.queue_name.clone());
            state.jobs.insert(
                key.clone(),
                JobRecord::new(&request.queue_name, request.payload, request.options, None),
            );
            state.push_ready(&request.queue_name, key);
        }

        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.wake([request.queue_name]);
        Ok(job_id)
    }

    async fn add_flow(&self, flow: ChildSpec) -> Result<String, BrokerError> {
        self.check_available()?;

        let mut keys = Vec::new();
        collect_flow_keys(self, &flow, &mut keys);
        let unique: HashSet<&String> = keys.iter().collect();
        if unique.len() != keys.len() {
            return Err(BrokerError::invalid_flow(format!(
                "flow rooted at {} contains duplicate job ids",
                flow.job_id()
            )));
        }

        let root_id = flow.job_id().to_string();
        let mut woken = HashSet::new();
        {
            let mut state = self.state.lock();
            if state.jobs.contains_key(&keys[0]) {
                debug!(job_id = %root_id, "Duplicate flow root, keeping existing flow");
                return Ok(root_id);
            }
            if let Some(existing) = keys.iter().find(|k| state.jobs.contains_key(*k)) {
                return Err(BrokerError::invalid_flow(format!(
                    "job {existing} already exists"
                )));
            }
            self.insert_flow_node(&mut state, &flow, None, &mut woken)?;
        }

        self.submitted.fetch_add(keys.len() as u64, Ordering::SeqCst);
        info!(
            job_id = %root_id,
            nodes = keys.len(),
            "Flow submitted"
        );
        self.wake(woken);
        Ok(root_id)
    }

    async fn claim(&self, queue_name: &str) -> Result<Option<ClaimedJob>, BrokerError> {
        let mut state = self.state.lock();
        loop {
            let Some(key) = state.ready.get_mut(queue_name).and_then(|q| q.pop_front()) else {
                return Ok(None);
            };
            let Some(record) = state.jobs.get_mut(&key) else {
                continue;
            };
            if record.state != JobState::Waiting {
                continue;
            }

            record.state = JobState::Active;
            record.attempts_made += 1;
            let claimed = ClaimedJob {
                queue_name: record.queue_name.clone(),
                job_id: record.job_id.clone(),
                payload: record.payload.clone(),
                attempt: record.attempts_made,
                max_attempts: record.options.attempts,
                children_values: Arc::new(record.children_values.clone()),
            };
            self.emit(
                &claimed.queue_name,
                &claimed.job_id,
                JobEventKind::Active {
                    attempt: claimed.attempt,
                },
            );
            return Ok(Some(claimed));
        }
    }

    async fn complete(&self, job: &ClaimedJob, return_value: Value) -> Result<(), BrokerError> {
        let key = self.job_key(&job.queue_name, &job.job_id);
        let mut woken = Vec::new();
        {
            let mut state = self.state.lock();
            let record = state
                .jobs
                .get_mut(&key)
                .ok_or_else(|| BrokerError::job_not_found(&job.queue_name, &job.job_id))?;
            if record.state != JobState::Active {
                return Err(BrokerError::JobNotActive {
                    queue_name: job.queue_name.clone(),
                    job_id: job.job_id.clone(),
                });
            }

            record.state = JobState::Completed;
            record.return_value = Some(return_value.clone());
            let parent_key = record.parent_key.clone();
            let remove = record.options.remove_on_complete;

            self.emit(
                &job.queue_name,
                &job.job_id,
                JobEventKind::Completed {
                    return_value: return_value.clone(),
                },
            );
            state.resolve_watchers(&key, &JobOutcome::Completed(return_value.clone()));

            if let Some(parent_key) = parent_key {
                if let Some(parent) = state.jobs.get_mut(&parent_key) {
                    if parent.state == JobState::WaitingChildren {
                        parent.children_values.insert(key.clone(), return_value);
                        parent.pending_children = parent.pending_children.saturating_sub(1);
                        if parent.pending_children == 0 {
                            parent.state = JobState::Waiting;
                            let queue_name = parent.queue_name.clone();
                            state.push_ready(&queue_name, parent_key);
                            woken.push(queue_name);
                        }
                    }
                }
            }

            if remove {
                state.jobs.remove(&key);
            }
        }

        self.wake(woken);
        Ok(())
    }

    async fn fail(&self, job: &ClaimedJob, failure: JobFailure) -> Result<(), BrokerError> {
        let key = self.job_key(&job.queue_name, &job.job_id);
        let mut requeued = false;
        {
            let mut state = self.state.lock();
            let record = state
                .jobs
                .get_mut(&key)
                .ok_or_else(|| BrokerError::job_not_found(&job.queue_name, &job.job_id))?;
            if record.state != JobState::Active {
                return Err(BrokerError::JobNotActive {
                    queue_name: job.queue_name.clone(),
                    job_id: job.job_id.clone(),
                });
            }

            let attempt = record.attempts_made;
            let will_retry = failure.retryable && attempt < record.options.attempts;
            self.emit(
                &job.queue_name,
                &job.job_id,
                JobEventKind::Failed {
                    reason: failure.reason.clone(),
                    stack: failure.stack.clone(),
                    attempt,
                    will_retry,
                },
            );

            if will_retry {
                record.state = JobState::Waiting;
                state.push_ready(&job.queue_name, key);
                requeued = true;
            } else {
                record.state = JobState::Failed;
                record.failed_reason = Some(failure.reason.clone());
                state.resolve_watchers(
                    &key,
                    &JobOutcome::Failed {
                        reason: failure.reason.clone(),
                        stack: failure.stack.clone(),
                    },
                );
                self.fail_parents(&mut state, &key, &failure.reason);
            }
        }

        if requeued {
            self.wake([job.queue_name.clone()]);
        }
        Ok(())
    }

    fn watch(&self, queue_name: &str, job_id: &str) -> oneshot::Receiver<JobOutcome> {
        let key = self.job_key(queue_name, job_id);
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        let settled = state.jobs.get(&key).and_then(JobRecord::outcome);
        match settled {
            Some(outcome) => {
                let _ = tx.send(outcome);
            }
            None => state.watchers.entry(key).or_default().push(tx),
        }
        rx
    }

    fn unwatch(&self, queue_name: &str, job_id: &str) {
        let key = self.job_key(queue_name, job_id);
        let mut state = self.state.lock();
        if state.jobs.contains_key(&key) {
            return;
        }
        if let Some(watchers) = state.watchers.get_mut(&key) {
            watchers.retain(|watcher| !watcher.is_closed());
            if watchers.is_empty() {
                state.watchers.remove(&key);
            }
        }
    }

    fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn report_error(&self, queue_name: &str, job_id: &str, message: &str) {
        self.emit(
            queue_name,
            job_id,
            JobEventKind::Error {
                message: message.to_string(),
            },
        );
    }

    fn notifier(&self, queue_name: &str) -> Arc<Notify> {
        self.notifiers
            .entry(queue_name.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
