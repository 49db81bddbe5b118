//! PostgreSQL [`TaskRecordStore`] on the `distributed_tasks` table.
//!
//! Status updates are a single conditional `UPDATE` so concurrent writers
//! can't move a record backwards.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{DistributedTaskRecord, DistributedTaskStatus, StoreError, TaskRecordStore};

pub const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS distributed_tasks (
    id          UUID PRIMARY KEY,
    type        TEXT NOT NULL,
    status      TEXT NOT NULL,
    meta        JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_distributed_tasks_type_status
    ON distributed_tasks (type, status);
"#;

const RETURNING: &str = "id, type, status, meta, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgTaskRecordStore {
    pool: PgPool,
}

impl PgTaskRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table if needed.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;
        info!("distributed_tasks table ready");
        Ok(())
    }
}

fn database_error(error: sqlx::Error) -> StoreError {
    StoreError::Database(error.to_string())
}

fn record_from_row(row: &PgRow) -> Result<DistributedTaskRecord, StoreError> {
    let status: String = row.try_get("status").map_err(database_error)?;
    Ok(DistributedTaskRecord {
        id: row.try_get("id").map_err(database_error)?,
        task_type: row.try_get("type").map_err(database_error)?,
        status: status.parse()?,
        meta: row.try_get("meta").map_err(database_error)?,
        created_at: row.try_get("created_at").map_err(database_error)?,
        updated_at: row.try_get("updated_at").map_err(database_error)?,
    })
}

#[async_trait]
impl TaskRecordStore for PgTaskRecordStore {
    async fn create(
        &self,
        task_type: &str,
        meta: Value,
    ) -> Result<DistributedTaskRecord, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO distributed_tasks (id, type, status, meta) \
             VALUES ($1, $2, $3, $4) RETURNING {RETURNING}"
        ))
        .bind(Uuid::new_v4())
        .bind(task_type)
        .bind(DistributedTaskStatus::Pending.as_str())
        .bind(meta)
        .fetch_one(&self.pool)
        .await
        .map_err(database_error)?;

        record_from_row(&row)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: DistributedTaskStatus,
    ) -> Result<DistributedTaskRecord, StoreError> {
        let allowed: Vec<&str> = status.predecessors().iter().map(|s| s.as_str()).collect();

        let row = sqlx::query(&format!(
            "UPDATE distributed_tasks SET status = $2, updated_at = now() \
             WHERE id = $1 AND status = ANY($3) RETURNING {RETURNING}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;

        match row {
            Some(row) => {
                debug!(distributed_task_id = %id, to = %status, "Status transition");
                record_from_row(&row)
            }
            None => match self.find(id).await? {
                Some(current) => Err(StoreError::InvalidTransition {
                    id,
                    from: current.status,
                    to: status,
                }),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<DistributedTaskRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RETURNING} FROM distributed_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;

        row.as_ref().map(record_from_row).transpose()
    }

    fn provider_name(&self) -> &'static str {
        "postgres"
    }
}
