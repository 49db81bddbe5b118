#![allow(dead_code)]

pub mod strategies;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use jobflow::config::{DistributedConfig, JobflowConfig, WorkerConfig};
use jobflow::{
    ConfigManager, InMemoryPubSub, InMemoryQueueBroker, InMemoryTaskRecordStore, JobSystem, Middleware,
};

/// Upper bound for anything a test awaits.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A system wired to in-memory collaborators the test can inspect.
pub struct TestSystem {
    pub system: JobSystem,
    pub broker: Arc<InMemoryQueueBroker>,
    pub pubsub: Arc<InMemoryPubSub>,
    pub store: Arc<InMemoryTaskRecordStore>,
}

pub fn test_config() -> JobflowConfig {
    JobflowConfig {
        worker: WorkerConfig {
            default_concurrency: 4,
            poll_interval_ms: 10,
        },
        distributed: DistributedConfig {
            chunk_concurrency: 1,
            chunk_attempts: 1,
        },
        ..JobflowConfig::default()
    }
}

pub fn test_system() -> TestSystem {
    test_system_with(test_config())
}

pub fn test_system_with(config: JobflowConfig) -> TestSystem {
    test_system_with_middlewares(config, Vec::new())
}

pub fn test_system_with_middlewares(
    config: JobflowConfig,
    middlewares: Vec<Arc<dyn Middleware>>,
) -> TestSystem {
    let broker = Arc::new(InMemoryQueueBroker::with_config(
        &config.broker,
        config.events.broadcast_buffer_size,
    ));
    let pubsub = Arc::new(InMemoryPubSub::new(config.events.pubsub_buffer_size));
    let store = Arc::new(InMemoryTaskRecordStore::new());

    let mut builder = JobSystem::builder()
        .config_manager(ConfigManager::from_config(config).expect("valid test config"))
        .broker(broker.clone())
        .pubsub(pubsub.clone())
        .store(store.clone());
    for middleware in middlewares {
        builder = builder.middleware(middleware);
    }
    let system = builder.build().expect("test system");

    TestSystem {
        system,
        broker,
        pubsub,
        store,
    }
}

/// Await `future`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("test timed out")
}
