//! # Chunked Distributed Task Engine
//!
//! Splits one bulk operation into chunks, runs every chunk as its own job on
//! the broker and aggregates their outcomes on a single owner through the
//! run's pub/sub channel (`{runId}:events`). When any chunk fails, every chunk
//! that succeeded is compensated in reverse arrival order (saga rollback) and
//! the run's [`DistributedTaskRecord`](crate::store::DistributedTaskRecord) ends
//! `failed`.
//!
//! ## Run lifecycle
//!
//! ```text
//! create record (pending)
//!   ├─ no chunks ──────────────────────────────▶ completed
//!   └─ subscribe {runId}:events ─▶ processing ─▶ enqueue {taskId}&{index}
//!        └─ aggregate until every index settled
//!             ├─ all done ─────────────────────▶ completed
//!             ├─ any error ─▶ rollback (reverse) ▶ failed
//!             └─ protocol violation ───────────▶ failed (no rollback)
//! ```
//!
//! Chunk jobs are executed by workers the engine starts lazily, one per task
//! type, bounded by `distributed.chunk_concurrency`.

mod chunk;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::QueueBroker;
use crate::config::DistributedConfig;
use crate::constants::{defaults, CHUNK_ID_SEPARATOR};
use crate::error::{JobflowError, JobflowResult};
use crate::job::{JobOptions, JobRequest};
use crate::logging::{log_error, log_job_operation};
use crate::middleware::{JobExecution, Middleware, Next};
use crate::pubsub::{PubSub, Subscription};
use crate::registry::{validate_name, JobProcessor, Registry};
use crate::store::{DistributedTaskStatus, TaskRecordStore};
use crate::task::Payload;
use crate::trace::{chunk_job_id, events_channel};
use crate::worker::{panic_message, Worker};

use chunk::{ChunkJobPayload, RunFn};

pub use chunk::{ChunkEvent, ChunkOutcome, ChunkSpec, ChunkedTask, DistributedRunReport};

/// Type-erased `run` of one in-flight distributed run.
#[async_trait]
trait ChunkExecutor: Send + Sync + 'static {
    /// Run one chunk; `Err` carries the message published as `chunk:error`.
    async fn execute(&self, chunk: Value) -> Result<Value, String>;
}

struct TypedExecutor<T, R> {
    run: RunFn<T, R>,
}

#[async_trait]
impl<T: Payload, R: Payload> ChunkExecutor for TypedExecutor<T, R> {
    async fn execute(&self, chunk: Value) -> Result<Value, String> {
        let chunk: ChunkSpec<T> =
            serde_json::from_value(chunk).map_err(|e| format!("invalid chunk payload: {e}"))?;
        let run = Arc::clone(&self.run);

        match AssertUnwindSafe(async move { run(chunk).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => {
                serde_json::to_value(result).map_err(|e| format!("unserializable chunk result: {e}"))
            }
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(format!(
                "chunk handler panicked: {}",
                panic_message(panic.as_ref())
            )),
        }
    }
}

type ExecutorTable = Arc<DashMap<String, Arc<dyn ChunkExecutor>>>;

/// Worker-side processor of chunk jobs for one task type.
struct ChunkProcessor {
    task_type: String,
    executors: ExecutorTable,
    pubsub: Arc<dyn PubSub>,
}

#[async_trait]
impl JobProcessor for ChunkProcessor {
    async fn process(&self, execution: JobExecution) -> JobflowResult<Value> {
        let payload: ChunkJobPayload = serde_json::from_value(execution.data.clone())
            .map_err(|e| JobflowError::validation(format!("invalid chunk job payload: {e}")))?;
        let chunk_index = payload.chunk_index().ok_or_else(|| {
            JobflowError::validation(format!("chunk job {} has no chunkIndex", execution.job_id))
        })?;

        let executor = self
            .executors
            .get(&payload.run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                JobflowError::configuration(format!(
                    "no active run {} for {} in this process",
                    payload.run_id, self.task_type
                ))
            })?;

        let data = executor
            .execute(payload.chunk)
            .await
            .map_err(|message| JobflowError::ChunkFailed {
                chunk_index,
                message,
            })?;

        let event = ChunkEvent::Done {
            chunk_index,
            data: data.clone(),
        };
        self.pubsub
            .publish(&events_channel(&payload.run_id), &event.to_value())
            .await?;
        debug!(
            task_type = %self.task_type,
            run_id = %payload.run_id,
            chunk_index,
            "Chunk done"
        );
        Ok(data)
    }
}

/// Outermost layer of every chunk worker: a terminal failure anywhere in the
/// chain (middleware, payload, handler, publish) is announced as `chunk:error`.
/// Failures the broker will retry stay silent.
struct ChunkFailureReporter {
    pubsub: Arc<dyn PubSub>,
}

#[async_trait]
impl Middleware for ChunkFailureReporter {
    fn name(&self) -> &str {
        "chunk-failure-reporter"
    }

    async fn handle(&self, execution: JobExecution, next: Next) -> JobflowResult<Value> {
        let result = match AssertUnwindSafe(next.run(execution.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(JobflowError::handler(
                &execution.queue_name,
                format!("chunk job panicked: {}", panic_message(panic.as_ref())),
            )),
        };

        if let Err(error) = &result {
            if execution.is_last_attempt() || !error.is_retryable() {
                self.report(&execution, error).await;
            }
        }
        result
    }
}

impl ChunkFailureReporter {
    async fn report(&self, execution: &JobExecution, error: &JobflowError) {
        let run_id = execution.data.get("runId").and_then(Value::as_str);
        let chunk_index = chunk_index_of(execution);
        let (Some(run_id), Some(chunk_index)) = (run_id, chunk_index) else {
            error!(
                queue_name = %execution.queue_name,
                job_id = %execution.job_id,
                error = %error,
                "Chunk job failed without a run to report to"
            );
            return;
        };

        let message = match error {
            JobflowError::ChunkFailed { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let event = ChunkEvent::Error {
            chunk_index,
            error: message,
        };
        if let Err(e) = self
            .pubsub
            .publish(&events_channel(run_id), &event.to_value())
            .await
        {
            error!(
                queue_name = %execution.queue_name,
                run_id,
                chunk_index,
                error = %e,
                "Could not publish chunk error"
            );
        }
    }
}

/// Index from the payload, falling back to the `{taskId}&{index}` job id.
fn chunk_index_of(execution: &JobExecution) -> Option<usize> {
    execution
        .data
        .pointer("/chunk/chunkIndex")
        .and_then(Value::as_u64)
        .map(|i| i as usize)
        .or_else(|| {
            execution
                .job_id
                .rsplit_once(CHUNK_ID_SEPARATOR)
                .and_then(|(_, index)| index.parse().ok())
        })
}

/// Outcomes of every chunk of a run, in arrival order.
struct Settled<R> {
    successful: Vec<ChunkOutcome<R>>,
    failed: Vec<ChunkOutcome<R>>,
}

pub struct DistributedTaskEngine {
    broker: Arc<dyn QueueBroker>,
    pubsub: Arc<dyn PubSub>,
    store: Arc<dyn TaskRecordStore>,
    registry: Option<Arc<Registry>>,
    config: DistributedConfig,
    poll_interval: Duration,
    middlewares: Vec<Arc<dyn Middleware>>,
    executors: ExecutorTable,
    workers: DashMap<String, JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for DistributedTaskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedTaskEngine")
            .field("broker", &self.broker.provider_name())
            .field("pubsub", &self.pubsub.provider_name())
            .field("store", &self.store.provider_name())
            .field("config", &self.config)
            .field("active_runs", &self.executors.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl DistributedTaskEngine {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        pubsub: Arc<dyn PubSub>,
        store: Arc<dyn TaskRecordStore>,
        config: DistributedConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            pubsub,
            store,
            registry: None,
            config,
            poll_interval: Duration::from_millis(defaults::WORKER_POLL_INTERVAL_MS),
            middlewares: Vec::new(),
            executors: Arc::new(DashMap::new()),
            workers: DashMap::new(),
            shutdown,
        }
    }

    /// Reject task types that collide with a registered task or workflow queue.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_middlewares(mut self, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        self.middlewares = middlewares;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs currently aggregating in this process.
    pub fn active_runs(&self) -> usize {
        self.executors.len()
    }

    /// Task types with a running chunk worker.
    pub fn worker_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        queues.sort();
        queues
    }

    /// Execute every chunk of `task` on queue `task_type` and aggregate the
    /// outcomes. Resolves once every chunk settled; on any chunk failure the
    /// successful chunks are compensated and the first failure is returned.
    pub async fn run<T: Payload, R: Payload>(
        &self,
        task_type: &str,
        task: ChunkedTask<T, R>,
    ) -> JobflowResult<DistributedRunReport<R>> {
        validate_name(task_type)?;
        if let Some(registry) = &self.registry {
            if registry.contains(task_type) {
                return Err(JobflowError::configuration(format!(
                    "'{task_type}' is already registered as a task or workflow queue"
                )));
            }
        }

        let mut indices = HashSet::new();
        for chunk in &task.chunks {
            if !indices.insert(chunk.chunk_index) {
                return Err(JobflowError::validation(format!(
                    "duplicate chunk index {} for {task_type}",
                    chunk.chunk_index
                )));
            }
        }

        let ChunkedTask {
            chunks,
            run,
            rollback,
            meta,
        } = task;
        let chunk_count = chunks.len();

        let record = self
            .store
            .create(task_type, record_meta(meta, chunk_count))
            .await?;
        let task_id = record.id;

        if chunks.is_empty() {
            self.store
                .update_status(task_id, DistributedTaskStatus::Completed)
                .await?;
            info!(task_type, task_id = %task_id, "✅ Distributed run completed with no chunks");
            return Ok(DistributedRunReport {
                task_id,
                run_id: None,
                successful: Vec::new(),
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let channel = events_channel(&run_id);
        let mut subscription = match self.pubsub.subscribe(&channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.mark_failed(task_id).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .store
            .update_status(task_id, DistributedTaskStatus::Processing)
            .await
        {
            self.release(&run_id).await;
            self.mark_failed(task_id).await;
            return Err(e.into());
        }

        self.executors
            .insert(run_id.clone(), Arc::new(TypedExecutor { run }));
        self.ensure_chunk_worker(task_type);

        let record_id = task_id.to_string();
        let details = format!("run_id={run_id} chunks={chunk_count}");
        log_job_operation("distributed_run", task_type, Some(&record_id), None, "processing", Some(&details));

        if let Err(e) = self.enqueue_chunks(task_type, task_id, &run_id, &chunks).await {
            self.release(&run_id).await;
            self.mark_failed(task_id).await;
            log_error("distributed_engine", "enqueue_chunks", &e.to_string(), Some(&details));
            return Err(e);
        }

        let settled = aggregate::<R>(&mut subscription, &indices).await;
        self.release(&run_id).await;

        let Settled { successful, failed } = match settled {
            Ok(settled) => settled,
            Err(e) => {
                self.mark_failed(task_id).await;
                log_error("distributed_engine", "aggregate", &e.to_string(), Some(&details));
                return Err(e);
            }
        };

        if let Some(first) = failed.first() {
            let first_error = JobflowError::ChunkFailed {
                chunk_index: first.index,
                message: first.error.clone().unwrap_or_default(),
            };
            warn!(
                task_type,
                task_id = %task_id,
                run_id = %run_id,
                failed = failed.len(),
                successful = successful.len(),
                "Distributed run failed, rolling back successful chunks"
            );

            let mut specs: HashMap<usize, ChunkSpec<T>> =
                chunks.into_iter().map(|c| (c.chunk_index, c)).collect();
            let mut compensated = 0;
            for outcome in successful.into_iter().rev() {
                let (Some(chunk), Some(data)) = (specs.remove(&outcome.index), outcome.data) else {
                    continue;
                };
                let compensation = Arc::clone(&rollback);
                let result = AssertUnwindSafe(async move { compensation(chunk, data).await })
                    .catch_unwind()
                    .await;
                let message = match result {
                    Ok(Ok(())) => {
                        compensated += 1;
                        continue;
                    }
                    Ok(Err(e)) => format!("{e:#}"),
                    Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
                };
                let err = JobflowError::Rollback(format!("chunk {}: {message}", outcome.index));
                error!(task_type, task_id = %task_id, chunk_index = outcome.index, error = %err, "Chunk rollback failed");
            }

            self.mark_failed(task_id).await;
            info!(task_type, task_id = %task_id, compensated, "🔙 Distributed run rolled back");
            log_job_operation(
                "distributed_run",
                task_type,
                Some(&record_id),
                None,
                "failed",
                Some(&first_error.to_string()),
            );
            return Err(first_error);
        }

        self.store
            .update_status(task_id, DistributedTaskStatus::Completed)
            .await?;
        log_job_operation("distributed_run", task_type, Some(&record_id), None, "completed", Some(&details));

        Ok(DistributedRunReport {
            task_id,
            run_id: Some(run_id),
            successful,
        })
    }

    async fn enqueue_chunks<T: Payload>(
        &self,
        task_type: &str,
        task_id: Uuid,
        run_id: &str,
        chunks: &[ChunkSpec<T>],
    ) -> JobflowResult<()> {
        for chunk in chunks {
            let payload = ChunkJobPayload {
                run_id: run_id.to_string(),
                task_id,
                chunk: serde_json::to_value(chunk)?,
            };
            let options = JobOptions::new(chunk_job_id(&task_id, chunk.chunk_index))
                .with_attempts(self.config.chunk_attempts);
            self.broker
                .enqueue(JobRequest::new(task_type, serde_json::to_value(&payload)?, options))
                .await?;
        }
        Ok(())
    }

    fn ensure_chunk_worker(&self, task_type: &str) {
        self.workers
            .entry(task_type.to_string())
            .or_insert_with(|| {
                let processor = ChunkProcessor {
                    task_type: task_type.to_string(),
                    executors: Arc::clone(&self.executors),
                    pubsub: Arc::clone(&self.pubsub),
                };
                let mut middlewares: Vec<Arc<dyn Middleware>> =
                    vec![Arc::new(ChunkFailureReporter {
                        pubsub: Arc::clone(&self.pubsub),
                    })];
                middlewares.extend(self.middlewares.iter().cloned());
                Worker::new(
                    task_type,
                    self.config.chunk_concurrency,
                    Arc::new(processor),
                    middlewares,
                    Arc::clone(&self.broker),
                    self.poll_interval,
                )
                .spawn(self.shutdown.subscribe())
            });
    }

    /// Drop the run's subscription and executor.
    async fn release(&self, run_id: &str) {
        self.executors.remove(run_id);
        if let Err(e) = self.pubsub.unsubscribe(&events_channel(run_id)).await {
            warn!(run_id, error = %e, "Could not unsubscribe from run channel");
        }
    }

    async fn mark_failed(&self, task_id: Uuid) {
        if let Err(e) = self
            .store
            .update_status(task_id, DistributedTaskStatus::Failed)
            .await
        {
            error!(task_id = %task_id, error = %e, "Could not mark distributed task failed");
        }
    }

    /// Stop the chunk workers after their in-flight jobs.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let queues = self.worker_queues();
        for queue_name in queues {
            if let Some((_, handle)) = self.workers.remove(&queue_name) {
                if let Err(e) = handle.await {
                    warn!(queue_name = %queue_name, error = %e, "Chunk worker ended abnormally");
                }
            }
        }
    }
}

fn record_meta(meta: Value, chunk_count: usize) -> Value {
    match meta {
        Value::Object(mut map) => {
            map.insert("chunkCount".to_string(), json!(chunk_count));
            Value::Object(map)
        }
        Value::Null => json!({ "chunkCount": chunk_count }),
        other => json!({ "chunkCount": chunk_count, "data": other }),
    }
}

/// Consume events one at a time until every index in `expected` settled.
async fn aggregate<R: Payload>(
    subscription: &mut Subscription,
    expected: &HashSet<usize>,
) -> JobflowResult<Settled<R>> {
    let mut settled = HashSet::with_capacity(expected.len());
    let mut successful = Vec::new();
    let mut failed = Vec::new();

    while settled.len() < expected.len() {
        let message = subscription.recv().await.ok_or_else(|| {
            JobflowError::protocol(format!(
                "{} closed with {} of {} chunks settled",
                subscription.channel(),
                settled.len(),
                expected.len()
            ))
        })?;
        let event = ChunkEvent::try_from(message)?;
        let index = event.chunk_index();

        if !expected.contains(&index) {
            return Err(JobflowError::protocol(format!(
                "event for chunk {index} which is not part of this run"
            )));
        }
        if !settled.insert(index) {
            debug!(chunk_index = index, "Ignoring duplicate chunk event");
            continue;
        }

        match event {
            ChunkEvent::Done { data, .. } => {
                let data: R = serde_json::from_value(data).map_err(|e| {
                    JobflowError::protocol(format!("undecodable result for chunk {index}: {e}"))
                })?;
                successful.push(ChunkOutcome {
                    index,
                    data: Some(data),
                    error: None,
                });
            }
            ChunkEvent::Error { error, .. } => failed.push(ChunkOutcome {
                index,
                data: None,
                error: Some(error),
            }),
        }
    }

    Ok(Settled { successful, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryQueueBroker;
    use crate::pubsub::InMemoryPubSub;
    use crate::store::InMemoryTaskRecordStore;
    use parking_lot::Mutex;

    struct Fixture {
        pubsub: Arc<InMemoryPubSub>,
        store: Arc<InMemoryTaskRecordStore>,
        engine: DistributedTaskEngine,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryQueueBroker::new());
        let pubsub = Arc::new(InMemoryPubSub::new(64));
        let store = Arc::new(InMemoryTaskRecordStore::new());
        let engine = DistributedTaskEngine::new(
            broker,
            pubsub.clone(),
            store.clone(),
            DistributedConfig {
                chunk_concurrency: 1,
                chunk_attempts: 1,
            },
        )
        .with_poll_interval(Duration::from_millis(10));
        Fixture {
            pubsub,
            store,
            engine,
        }
    }

    async fn status(store: &InMemoryTaskRecordStore, id: Uuid) -> DistributedTaskStatus {
        store.find(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_chunks_run_and_aggregate() {
        let f = fixture();
        let task = ChunkedTask::new(ChunkSpec::split(vec![1u32, 2, 3, 4, 5], 2), |chunk| async move {
            Ok(chunk.data.iter().sum::<u32>())
        });

        let report = tokio::time::timeout(Duration::from_secs(5), f.engine.run("sum", task))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.results_by_index(), vec![(0, 3), (1, 7), (2, 5)]);
        assert_eq!(status(&f.store, report.task_id).await, DistributedTaskStatus::Completed);
        assert_eq!(f.engine.active_runs(), 0);
        assert_eq!(f.engine.worker_queues(), vec!["sum".to_string()]);
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_event_type_aborts_without_rollback() {
        let f = fixture();
        let rolled_back = Arc::new(Mutex::new(Vec::new()));
        let pubsub = f.pubsub.clone();
        let compensations = rolled_back.clone();

        let task = ChunkedTask::new(vec![ChunkSpec::new(0, vec![1u32])], move |_chunk| {
            let pubsub = pubsub.clone();
            async move {
                for channel in pubsub.channels() {
                    pubsub
                        .publish(&channel, &json!({"type": "chunk:progress", "chunkIndex": 0}))
                        .await?;
                }
                Ok(1u32)
            }
        })
        .with_rollback(move |chunk, _| {
            let compensations = compensations.clone();
            async move {
                compensations.lock().push(chunk.chunk_index);
                Ok(())
            }
        });

        let err = tokio::time::timeout(Duration::from_secs(5), f.engine.run("reindex", task))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, JobflowError::AggregationProtocol(_)));
        assert!(rolled_back.lock().is_empty());
        let record = &f.store.records_of_type("reindex")[0];
        assert_eq!(record.status, DistributedTaskStatus::Failed);
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_chunk_indices_are_rejected() {
        let f = fixture();
        let task = ChunkedTask::new(
            vec![ChunkSpec::new(0, vec![1u32]), ChunkSpec::new(0, vec![2u32])],
            |_chunk| async { Ok(0u32) },
        );
        let err = f.engine.run("dupes", task).await.unwrap_err();
        assert!(matches!(err, JobflowError::Validation(_)));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_registered_queue_name_is_rejected() {
        let f = fixture();
        let registry = Arc::new(Registry::new());
        registry
            .register(crate::registry::RegisteredJob {
                name: "embed".into(),
                kind: crate::registry::JobKind::Task,
                concurrency: None,
                processor: Arc::new(ChunkProcessor {
                    task_type: "embed".into(),
                    executors: Arc::new(DashMap::new()),
                    pubsub: f.pubsub.clone(),
                }),
            })
            .unwrap();
        let engine = f.engine.with_registry(registry);

        let task = ChunkedTask::new(vec![ChunkSpec::new(0, vec![1u32])], |_chunk| async { Ok(0u32) });
        let err = engine.run("embed", task).await.unwrap_err();
        assert!(matches!(err, JobflowError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_chunk_job_of_unknown_run_is_not_retryable() {
        let f = fixture();
        let processor = ChunkProcessor {
            task_type: "sum".into(),
            executors: Arc::new(DashMap::new()),
            pubsub: f.pubsub.clone(),
        };
        let execution = JobExecution {
            queue_name: "sum".into(),
            job_id: format!("{}&0", Uuid::new_v4()),
            attempt: 1,
            max_attempts: 3,
            data: json!({
                "runId": "gone",
                "taskId": Uuid::new_v4(),
                "chunk": {"chunkIndex": 0, "data": [1]},
            }),
            children_values: Arc::new(HashMap::new()),
        };

        let err = processor.process(execution).await.unwrap_err();
        assert!(matches!(err, JobflowError::Configuration(_)));
        assert!(!err.is_retryable());
    }

    fn chunk_execution(attempt: u32, data: Value) -> JobExecution {
        JobExecution {
            queue_name: "sum".into(),
            job_id: format!("{}&4", Uuid::new_v4()),
            attempt,
            max_attempts: 2,
            data,
            children_values: Arc::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn test_terminal_chain_failures_are_reported_as_chunk_errors() {
        let pubsub = Arc::new(InMemoryPubSub::new(8));
        let mut events = pubsub.subscribe("run-1:events").await.unwrap();
        let reporter: Arc<dyn Middleware> = Arc::new(ChunkFailureReporter {
            pubsub: pubsub.clone(),
        });
        let chain = crate::middleware::compose(
            vec![reporter],
            crate::middleware::execute_with(|execution: JobExecution| async move {
                if execution.attempt == 1 {
                    Err(JobflowError::dispatch("connection reset"))
                } else {
                    Err(JobflowError::validation("payload rejected"))
                }
            }),
        );

        // Retryable failure with attempts left: the broker retries, nobody hears about it.
        let first = chain
            .call(chunk_execution(1, json!({"runId": "run-1"})))
            .await;
        assert!(matches!(first, Err(JobflowError::Dispatch(_))));

        // No payload chunk index: the job id suffix identifies the chunk.
        let second = chain
            .call(chunk_execution(2, json!({"runId": "run-1"})))
            .await;
        assert!(matches!(second, Err(JobflowError::Validation(_))));

        let event = ChunkEvent::try_from(events.recv().await.unwrap()).unwrap();
        match event {
            ChunkEvent::Error { chunk_index, error } => {
                assert_eq!(chunk_index, 4);
                assert!(error.contains("payload rejected"));
            }
            other => panic!("expected chunk error, got {other:?}"),
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(50), events.recv())
                .await
                .is_err()
        );
    }

    #[test]
    fn test_record_meta_carries_chunk_count() {
        assert_eq!(record_meta(Value::Null, 3), json!({"chunkCount": 3}));
        assert_eq!(
            record_meta(json!({"documentId": 7}), 2),
            json!({"documentId": 7, "chunkCount": 2})
        );
        assert_eq!(record_meta(json!("x"), 1), json!({"chunkCount": 1, "data": "x"}));
    }
}
