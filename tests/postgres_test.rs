//! PostgreSQL record store and `LISTEN/NOTIFY` pub/sub.
//!
//! Run with `--features database-tests` and `DATABASE_URL` set; `sqlx::test`
//! gives every test its own database.

#![cfg(feature = "database-tests")]

mod common;

use std::time::Duration;

use common::{test_config, within};
use jobflow::pubsub::{PgNotifyPubSub, PubSubError};
use jobflow::store::{PgTaskRecordStore, StoreError};
use jobflow::{
    ChunkSpec, ChunkedTask, ConfigManager, DistributedTaskStatus, JobSystem, JobflowError, PubSub,
    TaskRecordStore,
};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

async fn migrated_store(pool: &PgPool) -> PgTaskRecordStore {
    let store = PgTaskRecordStore::new(pool.clone());
    store.migrate().await.expect("distributed_tasks migration");
    store
}

#[sqlx::test(migrations = false)]
async fn test_status_transitions_are_guarded(pool: PgPool) -> sqlx::Result<()> {
    let store = migrated_store(&pool).await;
    // Running the migration twice is harmless.
    store.migrate().await.unwrap();

    let record = store.create("reindex", json!({"chunkCount": 2})).await.unwrap();
    assert_eq!(record.status, DistributedTaskStatus::Pending);
    assert_eq!(record.meta, json!({"chunkCount": 2}));

    store
        .update_status(record.id, DistributedTaskStatus::Processing)
        .await
        .unwrap();
    let done = store
        .update_status(record.id, DistributedTaskStatus::Completed)
        .await
        .unwrap();
    assert!(done.updated_at >= record.updated_at);

    let err = store
        .update_status(record.id, DistributedTaskStatus::Failed)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::InvalidTransition {
            id: record.id,
            from: DistributedTaskStatus::Completed,
            to: DistributedTaskStatus::Failed,
        }
    );
    assert_eq!(
        store.find(record.id).await.unwrap().unwrap().status,
        DistributedTaskStatus::Completed
    );
    Ok(())
}

#[sqlx::test(migrations = false)]
async fn test_unknown_record(pool: PgPool) -> sqlx::Result<()> {
    let store = migrated_store(&pool).await;
    let id = Uuid::new_v4();

    assert!(store.find(id).await.unwrap().is_none());
    assert_eq!(
        store
            .update_status(id, DistributedTaskStatus::Failed)
            .await
            .unwrap_err(),
        StoreError::NotFound(id)
    );
    Ok(())
}

#[sqlx::test(migrations = false)]
async fn test_notify_round_trip(pool: PgPool) -> sqlx::Result<()> {
    let pubsub = PgNotifyPubSub::new(pool, 16);
    let mut subscription = pubsub.subscribe("run-1:events").await.unwrap();

    pubsub
        .publish("run-1:events", &json!({"type": "chunk:done", "chunkIndex": 3, "data": [1, 2]}))
        .await
        .unwrap();

    let message = within(subscription.recv()).await.unwrap();
    assert_eq!(message, json!({"type": "chunk:done", "chunkIndex": 3, "data": [1, 2]}));

    pubsub.unsubscribe("run-1:events").await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), subscription.recv()).await;
    assert!(matches!(closed, Ok(None)));
    Ok(())
}

#[sqlx::test(migrations = false)]
async fn test_oversized_notification_is_a_publish_error(pool: PgPool) -> sqlx::Result<()> {
    let pubsub = PgNotifyPubSub::new(pool, 16);
    let err = pubsub
        .publish("run-2:events", &json!({"data": "x".repeat(9_000)}))
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::Publish { .. }));
    Ok(())
}

#[sqlx::test(migrations = false)]
async fn test_run_settles_when_a_result_exceeds_the_notify_limit(pool: PgPool) -> sqlx::Result<()> {
    migrated_store(&pool).await;
    let system = JobSystem::builder()
        .config_manager(ConfigManager::from_config(test_config()).unwrap())
        .postgres(pool.clone(), 16)
        .build()
        .unwrap();

    let task = ChunkedTask::new(ChunkSpec::split(vec![10usize, 9_000], 1), |chunk| async move {
        Ok("x".repeat(chunk.data[0]))
    });

    let err = within(system.distributed().run("render", task)).await.unwrap_err();

    assert!(matches!(err, JobflowError::ChunkFailed { chunk_index: 1, .. }));
    let status: String =
        sqlx::query_scalar("SELECT status FROM distributed_tasks WHERE type = 'render'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(status, "failed");
    system.shutdown().await;
    Ok(())
}

