use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{DistributedTaskRecord, DistributedTaskStatus, StoreError, TaskRecordStore};

/// [`TaskRecordStore`] kept in a `DashMap`; records live as long as the store.
#[derive(Debug, Default)]
pub struct InMemoryTaskRecordStore {
    records: DashMap<Uuid, DistributedTaskRecord>,
}

impl InMemoryTaskRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records of `task_type`, oldest first.
    pub fn records_of_type(&self, task_type: &str) -> Vec<DistributedTaskRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.task_type == task_type)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

#[async_trait]
impl TaskRecordStore for InMemoryTaskRecordStore {
    async fn create(
        &self,
        task_type: &str,
        meta: Value,
    ) -> Result<DistributedTaskRecord, StoreError> {
        let now = Utc::now();
        let record = DistributedTaskRecord {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            status: DistributedTaskStatus::Pending,
            meta,
            created_at: now,
            updated_at: now,
        };
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: DistributedTaskStatus,
    ) -> Result<DistributedTaskRecord, StoreError> {
        let mut record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !record.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.status,
                to: status,
            });
        }
        debug!(distributed_task_id = %id, from = %record.status, to = %status, "Status transition");
        record.status = status;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn find(&self, id: Uuid) -> Result<Option<DistributedTaskRecord>, StoreError> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
