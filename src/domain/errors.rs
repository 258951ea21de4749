//! Domain errors for the task engine.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::task::TaskStatus;

/// Domain-level errors that can occur while running the engine.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Handler not registered for classification: {0}")]
    MissingHandler(String),

    #[error("Classification already registered: {0}")]
    DuplicateHandler(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Concurrency conflict: task {0} was modified by another claim")]
    Conflict(Uuid),

    #[error("Handler for task {task_id} failed: {message}")]
    HandlerError { task_id: Uuid, message: String },

    #[error("Worker terminated before reporting a result for job {job_id}")]
    WorkerTermination { job_id: Uuid },
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

/// Sentinel a handler raises to bypass the normal retry ladder and request a
/// specific state change (cancel / reschedule / force-retry) instead.
///
/// This is distinct from [`DomainError`] because it is not a failure: the
/// scheduler applies the requested transition verbatim rather than running
/// retry accounting against it.
#[derive(Debug, Clone)]
pub struct StateChangeRequest {
    pub target: StateChangeTarget,
    pub scheduled_to: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<crate::domain::models::task::ErrorRecord>,
}

/// Target statuses a [`StateChangeRequest`] may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeTarget {
    Canceled,
    WaitingRetry,
    Scheduled,
}

impl StateChangeTarget {
    pub fn as_task_status(self) -> TaskStatus {
        match self {
            Self::Canceled => TaskStatus::Canceled,
            Self::WaitingRetry => TaskStatus::WaitingRetry,
            Self::Scheduled => TaskStatus::Scheduled,
        }
    }
}

/// Everything a handler invocation can fail with: either an ordinary error
/// (drives the retry ladder) or an explicit [`StateChangeRequest`].
#[derive(Debug)]
pub enum HandlerOutcome {
    Error(anyhow::Error),
    StateChange(StateChangeRequest),
}

impl From<anyhow::Error> for HandlerOutcome {
    fn from(err: anyhow::Error) -> Self {
        Self::Error(err)
    }
}

/// Typed, client-facing rejections produced by [`crate::tracker::TaskTracker`].
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Task {task_id} failed: {details:?}")]
    TaskFailError {
        task_id: Uuid,
        details: Option<String>,
        next_action: TaskStatus,
    },

    #[error("Task {task_id} was canceled: {details:?}")]
    TaskCancelError {
        task_id: Uuid,
        details: Option<String>,
        next_action: TaskStatus,
    },

    #[error("Task {task_id} is waiting for retry: {meta:?}")]
    TaskRetryError {
        task_id: Uuid,
        details: Option<String>,
        meta: Option<String>,
        next_action: TaskStatus,
    },

    #[error("Task {task_id} was rescheduled: {meta:?}")]
    TaskRescheduleError {
        task_id: Uuid,
        details: Option<String>,
        meta: Option<String>,
        next_action: TaskStatus,
    },
}

impl ControlError {
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::TaskFailError { task_id, .. }
            | Self::TaskCancelError { task_id, .. }
            | Self::TaskRetryError { task_id, .. }
            | Self::TaskRescheduleError { task_id, .. } => *task_id,
        }
    }

    pub fn next_action(&self) -> TaskStatus {
        match self {
            Self::TaskFailError { next_action, .. }
            | Self::TaskCancelError { next_action, .. }
            | Self::TaskRetryError { next_action, .. }
            | Self::TaskRescheduleError { next_action, .. } => *next_action,
        }
    }
}
