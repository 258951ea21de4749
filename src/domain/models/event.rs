//! Event domain model — append-only records emitted during task execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event classification (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClassification {
    Status,
    Log,
    Progress,
}

impl EventClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Log => "log",
            Self::Progress => "progress",
        }
    }
}

/// An append-only record of a STATUS/LOG/PROGRESS observation.
///
/// Unique composite key: `(task_id, classification, uuid)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub uuid: Uuid,
    pub task_id: Uuid,
    pub classification: EventClassification,
    pub ts: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    pub fn new(task_id: Uuid, classification: EventClassification, payload: Value) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            task_id,
            classification,
            ts: Utc::now(),
            payload,
        }
    }

    /// The composite key used for idempotent persistence and dedup.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.task_id, self.classification.as_str(), self.uuid)
    }
}
