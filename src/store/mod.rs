//! # Distributed Task Records
//!
//! One [`DistributedTaskRecord`] tracks the status of one distributed run.
//! Status moves forward only:
//!
//! ```text
//! pending ──► processing ──► completed
//!    │            └────────► failed
//!    ├──────────────────────► completed   (empty chunk set)
//!    └──────────────────────► failed
//! ```

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryTaskRecordStore;
#[cfg(feature = "postgres")]
pub use postgres::PgTaskRecordStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Distributed task {0} not found")]
    NotFound(Uuid),

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: DistributedTaskStatus,
        to: DistributedTaskStatus,
    },

    #[error("Unknown distributed task status: {0}")]
    UnknownStatus(String),

    #[error("Database error: {0}")]
    Database(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributedTaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DistributedTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: DistributedTaskStatus) -> bool {
        use DistributedTaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    /// Statuses from which `self` may be entered.
    pub fn predecessors(&self) -> &'static [DistributedTaskStatus] {
        use DistributedTaskStatus::*;
        match self {
            Pending => &[],
            Processing => &[Pending],
            Completed | Failed => &[Pending, Processing],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DistributedTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributedTaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedTaskRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: DistributedTaskStatus,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskRecordStore: Send + Sync + 'static {
    /// Insert a new record in `pending`.
    async fn create(&self, task_type: &str, meta: Value)
        -> Result<DistributedTaskRecord, StoreError>;

    /// Move a record forward; backwards or terminal-leaving moves are rejected.
    async fn update_status(
        &self,
        id: Uuid,
        status: DistributedTaskStatus,
    ) -> Result<DistributedTaskRecord, StoreError>;

    async fn find(&self, id: Uuid) -> Result<Option<DistributedTaskRecord>, StoreError>;

    fn provider_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use DistributedTaskStatus::*;

    #[test]
    fn test_transitions() {
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));

        for status in [Pending, Processing, Completed, Failed] {
            for next in [Pending, Processing, Completed, Failed] {
                assert_eq!(
                    status.can_transition_to(next),
                    next.predecessors().contains(&status),
                    "{status} -> {next}"
                );
            }
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [Pending, Processing, Completed, Failed] {
            assert_eq!(status.to_string().parse::<DistributedTaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<DistributedTaskStatus>().is_err());
    }
}
