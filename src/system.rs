//! # Job System Bootstrap
//!
//! [`JobSystem`] wires one process's collaborators together: configuration,
//! registry, queue broker, pub/sub transport, record store and middlewares.
//! Nothing is global; tasks, workflows and distributed runs all receive their
//! collaborators from the system they were registered with.
//!
//! ```rust
//! use jobflow::system::JobSystem;
//! use jobflow::task::TaskDefinition;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), jobflow::JobflowError> {
//! let system = JobSystem::builder().build()?;
//! let shout = system.register_task(
//!     TaskDefinition::<String, String>::new("shout")
//!         .handler(|text, _ctx| async move { Ok(text.to_uppercase()) }),
//! )?;
//!
//! let workers = system.start_workers();
//! assert_eq!(shout.run_and_await(&"hi".to_string(), None).await?, "HI");
//! workers.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::broker::{InMemoryQueueBroker, QueueBroker};
use crate::config::{ConfigManager, JobflowConfig};
use crate::distributed::DistributedTaskEngine;
use crate::error::JobflowResult;
use crate::lifecycle::{LifecycleBridgeHandle, LifecycleEventBridge};
use crate::logging::init_structured_logging;
use crate::middleware::Middleware;
use crate::pubsub::{InMemoryPubSub, PubSub};
use crate::registry::Registry;
use crate::store::{InMemoryTaskRecordStore, TaskRecordStore};
use crate::task::{Payload, TaskDefinition, TaskHandle};
use crate::worker::WorkerRuntime;
use crate::workflow::{WorkflowDefinition, WorkflowHandle};

/// Snapshot of a running system for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub environment: String,
    pub broker: &'static str,
    pub pubsub: &'static str,
    pub store: &'static str,
    pub registered: Vec<String>,
    pub active_runs: usize,
}

#[derive(Default)]
pub struct JobSystemBuilder {
    config_manager: Option<Arc<ConfigManager>>,
    broker: Option<Arc<dyn QueueBroker>>,
    pubsub: Option<Arc<dyn PubSub>>,
    store: Option<Arc<dyn TaskRecordStore>>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for JobSystemBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystemBuilder")
            .field("config_manager", &self.config_manager.is_some())
            .field("broker", &self.broker.as_ref().map(|b| b.provider_name()))
            .field("pubsub", &self.pubsub.as_ref().map(|p| p.provider_name()))
            .field("store", &self.store.as_ref().map(|s| s.provider_name()))
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

impl JobSystemBuilder {
    pub fn config_manager(mut self, config_manager: Arc<ConfigManager>) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn QueueBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskRecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Middlewares wrap every job in registration order (first is outermost).
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Use PostgreSQL `LISTEN/NOTIFY` for run channels and the
    /// `distributed_tasks` table for records.
    #[cfg(feature = "postgres")]
    pub fn postgres(mut self, pool: sqlx::PgPool, pubsub_buffer_size: usize) -> Self {
        self.pubsub = Some(Arc::new(crate::pubsub::PgNotifyPubSub::new(
            pool.clone(),
            pubsub_buffer_size,
        )));
        self.store = Some(Arc::new(crate::store::PgTaskRecordStore::new(pool)));
        self
    }

    /// Validate the configuration, initialize logging from its `[logging]`
    /// section and fill missing collaborators with the in-memory
    /// implementations.
    pub fn build(self) -> JobflowResult<JobSystem> {
        let config_manager = match self.config_manager {
            Some(config_manager) => config_manager,
            None => ConfigManager::from_config(JobflowConfig::default())?,
        };
        let config = config_manager.config();
        config.validate()?;
        init_structured_logging(&config.logging);

        let broker = self.broker.unwrap_or_else(|| {
            Arc::new(InMemoryQueueBroker::with_config(
                &config.broker,
                config.events.broadcast_buffer_size,
            ))
        });
        let pubsub = self
            .pubsub
            .unwrap_or_else(|| Arc::new(InMemoryPubSub::new(config.events.pubsub_buffer_size)));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskRecordStore::new()));

        let registry = Arc::new(Registry::new());
        let distributed = DistributedTaskEngine::new(
            Arc::clone(&broker),
            Arc::clone(&pubsub),
            Arc::clone(&store),
            config.distributed.clone(),
        )
        .with_registry(Arc::clone(&registry))
        .with_middlewares(self.middlewares.clone())
        .with_poll_interval(config.worker.poll_interval());

        info!(
            environment = config_manager.environment(),
            broker = broker.provider_name(),
            pubsub = pubsub.provider_name(),
            store = store.provider_name(),
            middlewares = self.middlewares.len(),
            "✅ Job system ready"
        );

        Ok(JobSystem {
            config_manager,
            registry,
            broker,
            pubsub,
            store,
            middlewares: self.middlewares,
            distributed,
        })
    }
}

pub struct JobSystem {
    config_manager: Arc<ConfigManager>,
    registry: Arc<Registry>,
    broker: Arc<dyn QueueBroker>,
    pubsub: Arc<dyn PubSub>,
    store: Arc<dyn TaskRecordStore>,
    middlewares: Vec<Arc<dyn Middleware>>,
    distributed: DistributedTaskEngine,
}

impl fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystem")
            .field("environment", &self.config_manager.environment())
            .field("registry", &self.registry)
            .field("distributed", &self.distributed)
            .finish()
    }
}

impl JobSystem {
    pub fn builder() -> JobSystemBuilder {
        JobSystemBuilder::default()
    }

    /// Load configuration from the environment and build an in-memory system.
    pub fn from_environment() -> JobflowResult<JobSystem> {
        Self::builder().config_manager(ConfigManager::load()?).build()
    }

    pub fn register_task<I: Payload, O: Payload>(
        &self,
        definition: TaskDefinition<I, O>,
    ) -> JobflowResult<TaskHandle<I, O>> {
        definition.register(&self.registry, Arc::clone(&self.broker))
    }

    pub fn register_workflow<I: Payload, O: Payload>(
        &self,
        definition: WorkflowDefinition<I, O>,
    ) -> JobflowResult<WorkflowHandle<I, O>> {
        definition.register(&self.registry, Arc::clone(&self.broker))
    }

    pub fn distributed(&self) -> &DistributedTaskEngine {
        &self.distributed
    }

    /// Start one worker per registered task and workflow queue.
    pub fn start_workers(&self) -> WorkerRuntime {
        WorkerRuntime::start(
            &self.registry,
            Arc::clone(&self.broker),
            self.middlewares.clone(),
            &self.config().worker,
        )
    }

    /// Start `bridge` on this system's broker event stream.
    pub fn lifecycle_bridge(&self, bridge: LifecycleEventBridge) -> LifecycleBridgeHandle {
        bridge.spawn(self.broker.as_ref())
    }

    pub fn config(&self) -> &JobflowConfig {
        self.config_manager.config()
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.pubsub
    }

    pub fn store(&self) -> &Arc<dyn TaskRecordStore> {
        &self.store
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            environment: self.config_manager.environment().to_string(),
            broker: self.broker.provider_name(),
            pubsub: self.pubsub.provider_name(),
            store: self.store.provider_name(),
            registered: self.registry.list(),
            active_runs: self.distributed.active_runs(),
        }
    }

    /// Stop the distributed engine's chunk workers.
    pub async fn shutdown(&self) {
        self.distributed.shutdown().await;
        info!("🛑 Job system stopped");
    }
}

/// Open a connection pool from `database` settings.
#[cfg(feature = "postgres")]
pub async fn connect_postgres(
    database: &crate::config::DatabaseConfig,
) -> JobflowResult<sqlx::PgPool> {
    let url = database.url.as_deref().ok_or_else(|| {
        crate::error::JobflowError::configuration("database.url is not set")
    })?;
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(database.max_connections)
        .connect(url)
        .await
        .map_err(|e| crate::error::JobflowError::Store(format!("connect failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::error::JobflowError;

    #[test]
    fn test_builder_defaults_to_in_memory_collaborators() {
        let system = JobSystem::builder().build().unwrap();
        let status = system.status();
        assert_eq!(status.broker, "in_memory");
        assert_eq!(status.pubsub, "in_memory");
        assert_eq!(status.store, "in_memory");
        assert!(status.registered.is_empty());
        assert!(crate::logging::is_logging_initialized());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = JobflowConfig {
            worker: WorkerConfig {
                default_concurrency: 0,
                ..WorkerConfig::default()
            },
            ..JobflowConfig::default()
        };
        let manager = ConfigManager::from_config(config);
        let err = match manager {
            Ok(manager) => JobSystem::builder().config_manager(manager).build().unwrap_err(),
            Err(e) => e,
        };
        assert!(matches!(err, JobflowError::Configuration(_)));
    }

    #[test]
    fn test_task_and_workflow_names_collide() {
        let system = JobSystem::builder().build().unwrap();
        system
            .register_task(
                TaskDefinition::<u32, u32>::new("index").handler(|n, _ctx| async move { Ok(n) }),
            )
            .unwrap();
        let err = system
            .register_workflow(
                WorkflowDefinition::<u32, u32>::new("index")
                    .handler(|n, _ctx| async move { Ok(n) }),
            )
            .unwrap_err();
        assert!(matches!(err, JobflowError::Configuration(_)));
        assert_eq!(system.status().registered, vec!["index".to_string()]);
    }
}
