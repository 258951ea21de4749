//! Task domain model.
//!
//! A `Task` is the durable record the scheduler drives through its lifecycle:
//! claimed under a lease, handed to a handler, retried with backoff on
//! failure, and persisted back after every transition.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of a task in the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    WaitingRetry,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::WaitingRetry => "waiting_retry",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "scheduled" => Some(Self::Scheduled),
            "running" => Some(Self::Running),
            "waiting_retry" => Some(Self::WaitingRetry),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal statuses are sticky: no transition leaves them (spec.md §3).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Whether a task dispatches straight to a single handler or drives a
/// sequence of steps through the composite runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atomicity {
    Atomic,
    Composite,
}

impl Default for Atomicity {
    fn default() -> Self {
        Self::Atomic
    }
}

/// Backoff strategy for `WAITING_RETRY` scheduling (spec.md §4.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Fixed,
}

/// Jitter applied on top of the capped backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    None,
    Full,
}

/// `{strategy, baseMs, maxMs, jitter}` as defined in spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: Jitter,
}

impl Backoff {
    pub fn fixed(base_ms: u64, max_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_ms,
            max_ms,
            jitter: Jitter::None,
        }
    }

    pub fn exponential(base_ms: u64, max_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_ms,
            max_ms,
            jitter: Jitter::None,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(1_000, 60_000)
    }
}

/// A serialized handler error attached to a task or step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            code: None,
            details: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Serialize an arbitrary error into a record, the way the scheduler
    /// attaches handler failures to a task (spec.md §7).
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
            code: None,
            details: None,
        }
    }
}

/// `{classification, input}` — one entry in a composite task's step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub classification: String,
    pub input: Value,
}

/// Terminal status of one composite step's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

/// `{status, output?, error?, createdAt, updatedAt}` — the outcome of one
/// composite step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(output: Value, now: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Succeeded,
            output: Some(output),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn failed(error: ErrorRecord, now: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            created_at: now,
            updated_at: now,
        }
    }
}

/// `{ts, level, msg, meta?}` — one entry in a task's log tail or the task
/// logger's ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Severity of a [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Audit/bookkeeping fields shared by durable records. Composed into `Task`
/// rather than inherited (REDESIGN FLAGS: tagged records, not a class
/// hierarchy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFields {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl AuditFields {
    pub fn new(now: DateTime<Utc>, created_by: Option<String>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            created_by,
            updated_by: None,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>, updated_by: Option<String>) {
        self.updated_at = now;
        if updated_by.is_some() {
            self.updated_by = updated_by;
        }
    }
}

/// The central durable record driven by the scheduler (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub classification: String,
    pub atomicity: Atomicity,
    pub status: TaskStatus,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorRecord>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_owner: Option<String>,
    #[serde(default)]
    pub lease_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub log_tail: Vec<LogEntry>,
    pub log_tail_max: usize,
    pub audit: AuditFields,
    pub version: u64,
}

impl Task {
    /// Construct a new atomic task, PENDING by default.
    pub fn new_atomic(classification: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            classification: classification.into(),
            atomicity: Atomicity::Atomic,
            status: TaskStatus::Pending,
            input,
            output: None,
            error: None,
            attempt: 0,
            max_attempts: 3,
            backoff: Backoff::default(),
            next_run_at: None,
            scheduled_to: None,
            lease_owner: None,
            lease_expiry: None,
            steps: Vec::new(),
            current_step: 0,
            step_results: Vec::new(),
            log_tail: Vec::new(),
            log_tail_max: 100,
            audit: AuditFields::new(now, None),
            version: 1,
        }
    }

    /// Construct a new composite task from an ordered step list.
    pub fn new_composite(classification: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        let mut task = Self::new_atomic(classification, Value::Null);
        task.atomicity = Atomicity::Composite;
        task.steps = steps;
        task
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_scheduled_to(mut self, scheduled_to: DateTime<Utc>) -> Self {
        self.status = TaskStatus::Scheduled;
        self.scheduled_to = Some(scheduled_to);
        self
    }

    pub fn with_log_tail_max(mut self, max: usize) -> Self {
        self.log_tail_max = max;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Invariant: `attempt <= maxAttempts`.
    pub fn attempt_within_bounds(&self) -> bool {
        self.attempt <= self.max_attempts
    }

    /// Invariant: `leaseOwner`/`leaseExpiry` set iff RUNNING.
    pub fn lease_consistent(&self) -> bool {
        let has_lease = self.lease_owner.is_some() && self.lease_expiry.is_some();
        (self.status == TaskStatus::Running) == has_lease
    }

    /// Whether this task is eligible for claim at `now`: PENDING always is;
    /// SCHEDULED/WAITING_RETRY/RUNNING are eligible once their respective
    /// timestamp has passed (spec.md §4.5 step 1).
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Scheduled => self.scheduled_to.is_some_and(|t| t <= now),
            TaskStatus::WaitingRetry => self.next_run_at.is_some_and(|t| t <= now),
            TaskStatus::Running => self.lease_expiry.is_some_and(|t| t <= now),
            _ => false,
        }
    }

    /// Invariant: composite step bookkeeping stays in range.
    pub fn composite_consistent(&self) -> bool {
        if self.atomicity != Atomicity::Composite {
            return true;
        }
        self.current_step <= self.steps.len()
            && self.step_results.len() <= self.current_step
            && self
                .step_results
                .iter()
                .take(self.current_step)
                .all(|r| matches!(r.status, StepStatus::Succeeded | StepStatus::Failed))
    }

    /// Append a batch of log entries, truncating to the most recent
    /// `log_tail_max` (spec.md §4.7 `appendLog`).
    pub fn append_log_tail(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        self.log_tail.extend(entries);
        if self.log_tail.len() > self.log_tail_max {
            let excess = self.log_tail.len() - self.log_tail_max;
            self.log_tail.drain(..excess);
        }
    }

    /// Apply a claim: transition to RUNNING with a fresh lease, clearing any
    /// scheduling timestamps (spec.md §4.5 step 2).
    pub fn apply_claim(&mut self, worker_id: &str, lease_ms: u64, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.lease_owner = Some(worker_id.to_string());
        self.lease_expiry = Some(now + chrono::Duration::milliseconds(lease_ms as i64));
        self.scheduled_to = None;
        self.next_run_at = None;
        self.audit.touch(now, None);
        self.version += 1;
    }

    /// Extend the lease from a heartbeat, iff the caller still owns the
    /// claim (spec.md §4.3 `heartbeat`).
    pub fn heartbeat(&mut self, owner: &str, lease_ms: u64, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running || self.lease_owner.as_deref() != Some(owner) {
            return false;
        }
        self.lease_expiry = Some(now + chrono::Duration::milliseconds(lease_ms as i64));
        true
    }

    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expiry = None;
    }

    /// Apply a terminal SUCCEEDED transition (spec.md §4.5.1 step 3).
    pub fn apply_success(&mut self, output: Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Succeeded;
        self.output = Some(output);
        self.error = None;
        self.clear_lease();
        self.audit.touch(now, None);
        self.version += 1;
    }

    /// Apply a WAITING_RETRY transition after a handler failure
    /// (spec.md §4.5.1 step 4).
    pub fn apply_retry(&mut self, error: ErrorRecord, next_run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.attempt += 1;
        self.status = TaskStatus::WaitingRetry;
        self.error = Some(error);
        self.next_run_at = Some(next_run_at);
        self.clear_lease();
        self.audit.touch(now, None);
        self.version += 1;
    }

    /// Apply a terminal FAILED transition after retries are exhausted
    /// (spec.md §4.5.1 step 4, else branch).
    pub fn apply_failure(&mut self, error: ErrorRecord, now: DateTime<Utc>) {
        self.attempt += 1;
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.clear_lease();
        self.audit.touch(now, None);
        self.version += 1;
    }

    /// Apply an explicit cancellation (spec.md §4.5.3).
    pub fn apply_cancel(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Canceled;
        self.error = Some(ErrorRecord::new(format!("Task {} canceled", self.id)).with_code(400));
        self.clear_lease();
        self.next_run_at = None;
        self.scheduled_to = None;
        self.audit.touch(now, None);
        self.version += 1;
    }
}

/// Per-execution handler input, routed through the registry by
/// `task.classification` (atomic) or a [`StepSpec::classification`]
/// (composite step).
pub type HandlerInput = Value;

/// Custom key/value payload a handler may stash in a step or task context.
pub type CustomMap = HashMap<String, Value>;
