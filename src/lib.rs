#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Jobflow Core
//!
//! Job orchestration core: turns large, failure-prone background operations
//! into independently schedulable units of work, runs them on a worker pool
//! and either lets the whole operation succeed or compensates what did.
//!
//! ## Overview
//!
//! Three ways to put work on a queue, all sharing one [`QueueBroker`]
//! abstraction and trace-id propagation:
//!
//! - **Tasks** ([`task`]): one typed handler with input/output schemas and a
//!   per-invocation rollback stack.
//! - **Workflows** ([`workflow`]): a dependency tree of tasks and workflows
//!   submitted atomically as one flow; the root's barrier handler collects its
//!   children's results.
//! - **Distributed runs** ([`distributed`]): one bulk operation split into
//!   chunks, aggregated over pub/sub on a single owner, compensated in reverse
//!   when any chunk fails.
//!
//! Cross-cutting machinery: a [`middleware`] chain around every execution and
//! a [`lifecycle`] bridge turning queue events into structured logs and hooks.
//!
//! ## Module Organization
//!
//! - [`system`] - Bootstrap wiring every collaborator together
//! - [`broker`], [`pubsub`], [`store`] - Collaborator contracts and implementations
//! - [`worker`] - Per-queue workers with bounded concurrency
//! - [`trace`], [`correlation`] - Job-id naming and child result matching
//! - [`schema`] - Typed payload validation
//! - [`config`], [`logging`], [`error`] - Ambient configuration, logging and errors
//!
//! ## Quick Start
//!
//! ```rust
//! use jobflow::distributed::{ChunkSpec, ChunkedTask};
//! use jobflow::system::JobSystem;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), jobflow::JobflowError> {
//! let system = JobSystem::builder().build()?;
//!
//! let chunks = ChunkSpec::split((1..=10).collect::<Vec<u64>>(), 4);
//! let task = ChunkedTask::new(chunks, |chunk| async move {
//!     Ok(chunk.data.iter().sum::<u64>())
//! });
//!
//! let report = system.distributed().run("sum-units", task).await?;
//! let total: u64 = report.results_by_index().into_iter().map(|(_, sum)| sum).sum();
//! assert_eq!(total, 55);
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod constants;
pub mod correlation;
pub mod distributed;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod logging;
pub mod middleware;
pub mod pubsub;
pub mod registry;
pub mod schema;
pub mod store;
pub mod system;
pub mod task;
pub mod trace;
pub mod worker;
pub mod workflow;

pub use broker::{BrokerError, InMemoryQueueBroker, QueueBroker};
pub use config::{ConfigManager, JobflowConfig};
pub use distributed::{ChunkSpec, ChunkedTask, DistributedRunReport, DistributedTaskEngine};
pub use error::{JobflowError, JobflowResult};
pub use job::{ChildSpec, JobData, JobOptions};
pub use lifecycle::{LifecycleEventBridge, LifecycleHook};
pub use middleware::{compose, LoggingMiddleware, MetricsMiddleware, Middleware, Next};
pub use pubsub::{InMemoryPubSub, PubSub};
pub use registry::Registry;
pub use schema::Schema;
pub use store::{DistributedTaskStatus, InMemoryTaskRecordStore, TaskRecordStore};
pub use system::JobSystem;
pub use task::{BarrierContext, JobHandle, TaskContext, TaskDefinition, TaskHandle};
pub use trace::TraceId;
pub use workflow::{BuildContext, WorkflowDefinition, WorkflowHandle};
