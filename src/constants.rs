//! # System Constants
//!
//! Naming conventions shared with dependent tooling. Changing any of these
//! breaks interoperability with jobs already sitting in a broker.

/// Separator between the segments of task, child and root job ids.
pub const JOB_ID_SEPARATOR: char = ':';

/// Separator between a distributed task id and a chunk index.
pub const CHUNK_ID_SEPARATOR: char = '&';

/// Middle segment of a workflow root job id: `{name}:root:{traceId}`.
pub const ROOT_SEGMENT: &str = "root";

/// Suffix of the pub/sub channel of one distributed run: `{runId}:events`.
pub const EVENTS_CHANNEL_SUFFIX: &str = "events";

/// Length of the random hex suffix on child job ids.
pub const CHILD_SUFFIX_LEN: usize = 8;

/// Chunk protocol event types published on a run's channel.
pub mod chunk_events {
    pub const CHUNK_DONE: &str = "chunk:done";
    pub const CHUNK_ERROR: &str = "chunk:error";
}

/// Queue lifecycle event names, as emitted by workers.
pub mod lifecycle_events {
    pub const ACTIVE: &str = "active";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const ERROR: &str = "error";
}

/// Default values shared by configuration and builders.
pub mod defaults {
    pub const WORKER_CONCURRENCY: usize = 1;
    pub const WORKER_POLL_INTERVAL_MS: u64 = 500;
    pub const EVENT_BROADCAST_BUFFER: usize = 1024;
    pub const PUBSUB_BUFFER: usize = 256;
    pub const CHUNK_CONCURRENCY: usize = 4;
    pub const JOB_ATTEMPTS: u32 = 1;
    pub const KEY_PREFIX: &str = "jobflow";
}
