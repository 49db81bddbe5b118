//! Chunk types and the `{runId}:events` wire protocol.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::constants::chunk_events::{CHUNK_DONE, CHUNK_ERROR};
use crate::error::{JobflowError, JobflowResult};

/// One slice of a bulk operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSpec<T> {
    pub chunk_index: usize,
    pub data: Vec<T>,
}

impl<T> ChunkSpec<T> {
    pub fn new(chunk_index: usize, data: Vec<T>) -> Self {
        Self { chunk_index, data }
    }

    /// Split `items` into chunks of at most `size` items, indexed from 0.
    pub fn split(items: Vec<T>, size: usize) -> Vec<ChunkSpec<T>> {
        let size = size.max(1);
        let mut chunks = Vec::new();
        let mut current = Vec::with_capacity(size);
        for item in items {
            current.push(item);
            if current.len() == size {
                let index = chunks.len();
                chunks.push(ChunkSpec::new(index, std::mem::take(&mut current)));
            }
        }
        if !current.is_empty() {
            let index = chunks.len();
            chunks.push(ChunkSpec::new(index, current));
        }
        chunks
    }
}

pub(crate) type RunFn<T, R> =
    Arc<dyn Fn(ChunkSpec<T>) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

pub(crate) type RollbackFn<T, R> =
    Arc<dyn Fn(ChunkSpec<T>, R) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn no_rollback<T, R>(_: ChunkSpec<T>, _: R) -> BoxFuture<'static, anyhow::Result<()>> {
    async { Ok(()) }.boxed()
}

/// A bulk operation: its chunks, the per-chunk work and its compensation.
pub struct ChunkedTask<T, R> {
    pub(crate) chunks: Vec<ChunkSpec<T>>,
    pub(crate) run: RunFn<T, R>,
    pub(crate) rollback: RollbackFn<T, R>,
    pub(crate) meta: Value,
}

impl<T, R> fmt::Debug for ChunkedTask<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedTask")
            .field("chunks", &self.chunks.len())
            .field("meta", &self.meta)
            .finish()
    }
}

impl<T, R> ChunkedTask<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// `run` executes one chunk on a worker; without `with_rollback`,
    /// successful chunks have nothing to compensate.
    pub fn new<F, Fut>(chunks: Vec<ChunkSpec<T>>, run: F) -> Self
    where
        F: Fn(ChunkSpec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self {
            chunks,
            run: Arc::new(move |chunk| run(chunk).boxed()),
            rollback: Arc::new(no_rollback::<T, R>),
            meta: Value::Null,
        }
    }

    /// Undo one successful chunk given its result.
    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn(ChunkSpec<T>, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.rollback = Arc::new(move |chunk, result| rollback(chunk, result).boxed());
        self
    }

    /// Free-form metadata stored on the distributed task record.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Payload of one chunk job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChunkJobPayload {
    pub run_id: String,
    pub task_id: Uuid,
    pub chunk: Value,
}

impl ChunkJobPayload {
    pub fn chunk_index(&self) -> Option<usize> {
        self.chunk
            .get("chunkIndex")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
    }
}

/// One message on a run's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEvent {
    Done { chunk_index: usize, data: Value },
    Error { chunk_index: usize, error: String },
}

impl ChunkEvent {
    pub fn chunk_index(&self) -> usize {
        match self {
            ChunkEvent::Done { chunk_index, .. } | ChunkEvent::Error { chunk_index, .. } => *chunk_index,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ChunkEvent::Done { chunk_index, data } => json!({
                "type": CHUNK_DONE,
                "chunkIndex": chunk_index,
                "data": data,
            }),
            ChunkEvent::Error { chunk_index, error } => json!({
                "type": CHUNK_ERROR,
                "chunkIndex": chunk_index,
                "error": error,
            }),
        }
    }
}

impl TryFrom<Value> for ChunkEvent {
    type Error = JobflowError;

    fn try_from(value: Value) -> JobflowResult<ChunkEvent> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| JobflowError::protocol(format!("event without type: {value}")))?;
        let chunk_index = value
            .get("chunkIndex")
            .and_then(Value::as_u64)
            .ok_or_else(|| JobflowError::protocol(format!("event without chunkIndex: {value}")))?
            as usize;

        match kind {
            CHUNK_DONE => Ok(ChunkEvent::Done {
                chunk_index,
                data: value.get("data").cloned().unwrap_or(Value::Null),
            }),
            CHUNK_ERROR => Ok(ChunkEvent::Error {
                chunk_index,
                error: value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown chunk error")
                    .to_string(),
            }),
            other => Err(JobflowError::protocol(format!(
                "unknown event type '{other}'"
            ))),
        }
    }
}

/// Result of one chunk as seen by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome<R> {
    pub index: usize,
    pub data: Option<R>,
    pub error: Option<String>,
}

/// Successful distributed run.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedRunReport<R> {
    pub task_id: Uuid,
    /// `None` for an empty chunk set, which never opens a channel.
    pub run_id: Option<String>,
    /// Chunk results in arrival order.
    pub successful: Vec<ChunkOutcome<R>>,
}

impl<R: Clone> DistributedRunReport<R> {
    /// Results ordered by chunk index.
    pub fn results_by_index(&self) -> Vec<(usize, R)> {
        let mut results: Vec<(usize, R)> = self
            .successful
            .iter()
            .filter_map(|o| o.data.clone().map(|d| (o.index, d)))
            .collect();
        results.sort_by_key(|(index, _)| *index);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_into_chunks() {
        let chunks = ChunkSpec::split((0..7).collect::<Vec<u32>>(), 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], ChunkSpec::new(2, vec![6]));
        assert!(ChunkSpec::<u32>::split(vec![], 3).is_empty());
    }

    #[test]
    fn test_chunk_spec_wire_format() {
        let value = serde_json::to_value(ChunkSpec::new(1, vec!["a"])).unwrap();
        assert_eq!(value, json!({"chunkIndex": 1, "data": ["a"]}));
    }

    #[test]
    fn test_parse_events() {
        let done = ChunkEvent::try_from(json!({"type": "chunk:done", "chunkIndex": 2, "data": 5}))
            .unwrap();
        assert_eq!(done, ChunkEvent::Done { chunk_index: 2, data: json!(5) });
        assert_eq!(ChunkEvent::try_from(done.to_value()).unwrap(), done);

        let error =
            ChunkEvent::try_from(json!({"type": "chunk:error", "chunkIndex": 0, "error": "x"}))
                .unwrap();
        assert_eq!(error.chunk_index(), 0);
    }

    #[test]
    fn test_protocol_violations() {
        for bad in [
            json!({"type": "chunk:progress", "chunkIndex": 0}),
            json!({"chunkIndex": 0}),
            json!({"type": "chunk:done"}),
            json!("chunk:done"),
        ] {
            assert!(matches!(
                ChunkEvent::try_from(bad),
                Err(JobflowError::AggregationProtocol(_))
            ));
        }
    }
}
