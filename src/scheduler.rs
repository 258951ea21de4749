//! Scheduler (spec.md §4.5): claims runnable tasks under a lease, executes
//! them concurrently up to `concurrency`, and applies the retry/backoff or
//! terminal transition the outcome calls for.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;
use uuid::Uuid;

use crate::composite;
use crate::context::{ContextSinks, TaskContext};
use crate::dispatch::Dispatcher;
use crate::domain::errors::{DomainError, DomainResult, HandlerOutcome, StateChangeRequest, StateChangeTarget};
use crate::domain::models::{Atomicity, Backoff, BackoffStrategy, ErrorRecord, Jitter, LogEntry, Task, TaskStatus};
use crate::domain::ports::persistence::{attr, Condition, Query, Repository};
use crate::pipeline::EventPipeline;
use crate::pool::WorkerPool;
use crate::registry::HandlerRegistry;
use crate::task_logger::TaskLogger;
use crate::tracker::TaskTracker;

/// Tunables driving one scheduler instance (spec.md §6.3).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub lease_ms: u64,
    pub poll_ms_idle: u64,
    pub poll_ms_busy: u64,
    pub log_tail_max: usize,
    pub stream_buffer_size: usize,
    pub max_logging_buffer: usize,
    pub logging_buffer_truncation: usize,
    pub graceful_shutdown_ms_timeout: u64,
    /// Number of worker-pool threads to run handlers on instead of inline
    /// (spec.md §4.8, §6.3 `workerPool`). `None` keeps the default inline
    /// dispatch.
    pub worker_pool: Option<usize>,
}

impl SchedulerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            concurrency: 4,
            lease_ms: 30_000,
            poll_ms_idle: 1_000,
            poll_ms_busy: 50,
            log_tail_max: 100,
            stream_buffer_size: 20,
            max_logging_buffer: 200,
            logging_buffer_truncation: 50,
            graceful_shutdown_ms_timeout: 5_000,
            worker_pool: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_worker_pool(mut self, size: usize) -> Self {
        self.worker_pool = Some(size);
        self
    }
}

/// `computeBackoffMs(attempt, cfg)` (spec.md §4.5.2): exponential doubling
/// with a cap (grounded on `RetryPolicy::calculate_backoff`'s
/// arithmetic), extended with a FIXED strategy and FULL jitter.
pub fn compute_backoff_ms(attempt: u32, backoff: &Backoff) -> u64 {
    let raw = match backoff.strategy {
        BackoffStrategy::Fixed => backoff.base_ms,
        BackoffStrategy::Exponential => {
            let exponent = attempt.saturating_sub(1);
            backoff.base_ms.saturating_mul(2_u64.saturating_pow(exponent))
        }
    };
    let capped = raw.min(backoff.max_ms);
    match backoff.jitter {
        Jitter::None => capped,
        Jitter::Full => {
            if capped == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..=capped)
            }
        }
    }
}

/// Build the claim-batch condition: PENDING, or any of
/// SCHEDULED/WAITING_RETRY/RUNNING whose due timestamp has passed
/// (spec.md §4.5 step 1).
fn runnable_condition(now: DateTime<Utc>) -> Condition {
    attr("status")
        .eq("pending")
        .or(attr("status").eq("scheduled").and(attr("scheduled_to").lte(now)))
        .or(attr("status").eq("waiting_retry").and(attr("next_run_at").lte(now)))
        .or(attr("status").eq("running").and(attr("lease_expiry").lte(now)))
}

struct SchedulerSinks {
    task_id: Uuid,
    worker_id: String,
    lease_ms: u64,
    task_repo: Arc<dyn Repository<Task>>,
    pipeline: Arc<EventPipeline>,
}

#[async_trait]
impl ContextSinks for SchedulerSinks {
    async fn heartbeat(&self) -> bool {
        match self.task_repo.read(self.task_id).await {
            Ok(mut task) => {
                if !task.heartbeat(&self.worker_id, self.lease_ms, Utc::now()) {
                    return false;
                }
                self.task_repo.update(&task).await.is_ok()
            }
            Err(_) => false,
        }
    }

    async fn pipe(&self, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        self.pipeline.append_log(self.task_id, entries.clone()).await;
        for entry in entries {
            let payload = serde_json::json!({ "level": entry.level, "msg": entry.msg, "meta": entry.meta });
            if let Err(err) = self.pipeline.emit_log(self.task_id, payload).await {
                tracing::warn!(task_id = %self.task_id, error = %err, "pipe: failed to emit log event");
            }
        }
    }

    async fn progress(&self, data: Value) {
        if let Err(err) = self.pipeline.emit_progress(self.task_id, data).await {
            tracing::warn!(task_id = %self.task_id, error = %err, "progress: failed to emit progress event");
        }
    }
}

/// Drives the claim → execute → settle loop described in spec.md §4.5.
pub struct Scheduler {
    config: SchedulerConfig,
    task_repo: Arc<dyn Repository<Task>>,
    registry: Arc<HandlerRegistry>,
    pipeline: Arc<EventPipeline>,
    pool: Option<Arc<WorkerPool>>,
    running: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, task_repo: Arc<dyn Repository<Task>>, registry: Arc<HandlerRegistry>, pipeline: Arc<EventPipeline>) -> Self {
        let pool = config.worker_pool.map(|size| Arc::new(WorkerPool::spawn(size)));
        Self {
            config,
            task_repo,
            registry,
            pipeline,
            pool,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start the cooperative polling loop on a background task. Returns a
    /// join handle the caller may await on shutdown.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                let claimed = this.tick().await;
                let idle = claimed == 0;
                let sleep_ms = if idle { this.config.poll_ms_idle } else { this.config.poll_ms_busy };
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
        })
    }

    /// Signal the loop to stop and wait (up to `graceful_shutdown_ms_timeout`)
    /// for in-flight executions to reach a terminal status, tracking each via
    /// a fresh [`TaskTracker`] (spec.md §5 cancellation/shutdown semantics).
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let ids: Vec<Uuid> = self.in_flight.lock().await.iter().copied().collect();
        if ids.is_empty() {
            return;
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.graceful_shutdown_ms_timeout);
        let bus = self.pipeline.bus();
        for id in ids {
            let Ok(tracker) = TaskTracker::for_id(id, self.task_repo.clone(), bus.clone()).await else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracker.unsubscribe().await;
                break;
            }
            let _ = tokio::time::timeout(remaining, tracker.wait()).await;
            tracker.unsubscribe().await;
        }
    }

    /// One polling iteration: claim up to `concurrency` runnable tasks and
    /// execute them concurrently. Returns the number of tasks claimed.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> usize {
        match self.claim_batch().await {
            Ok(claimed) => {
                let n = claimed.len();
                if n > 0 {
                    let mut in_flight = self.in_flight.lock().await;
                    for task in &claimed {
                        in_flight.insert(task.id);
                    }
                    drop(in_flight);

                    let futures = claimed.into_iter().map(|task| {
                        let this_in_flight = self.in_flight.clone();
                        async move {
                            let id = task.id;
                            self.execute(task).await;
                            this_in_flight.lock().await.remove(&id);
                        }
                    });
                    futures::future::join_all(futures).await;
                }
                n
            }
            Err(err) => {
                tracing::warn!(error = %err, "tick: failed to claim batch");
                0
            }
        }
    }

    async fn claim_batch(&self) -> DomainResult<Vec<Task>> {
        let now = Utc::now();
        let fetch_limit = (self.config.concurrency * 4).max(20);
        let query = Query::new().where_(runnable_condition(now)).limit(fetch_limit);
        let candidates = self.task_repo.select(query).await?;

        let mut claimed = Vec::with_capacity(self.config.concurrency);
        for candidate in candidates {
            if claimed.len() >= self.config.concurrency {
                break;
            }
            if let Some(task) = self.try_claim(candidate, now).await {
                claimed.push(task);
            }
        }
        Ok(claimed)
    }

    /// Best-effort re-read the candidate, re-validate it is still runnable,
    /// then attempt the CAS claim update. A stale candidate or a lost race
    /// against another worker is dropped silently (spec.md §8 claim
    /// idempotence law).
    async fn try_claim(&self, candidate: Task, now: DateTime<Utc>) -> Option<Task> {
        let mut task = match self.task_repo.read(candidate.id).await {
            Ok(task) => task,
            Err(_) => return None,
        };
        if !task.is_runnable(now) {
            return None;
        }

        task.apply_claim(&self.config.worker_id, self.config.lease_ms, now);
        match self.task_repo.update(&task).await {
            Ok(()) => Some(task),
            Err(DomainError::Conflict(_)) => None,
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "try_claim: unexpected update error");
                None
            }
        }
    }

    /// Execute one claimed task end to end (spec.md §4.5.1): emit RUNNING,
    /// build a context, dispatch to the registry or the composite runner,
    /// then apply success/retry/failure/state-change.
    async fn execute(&self, mut task: Task) {
        let task_id = task.id;
        let attempt = task.attempt;

        if let Err(err) = self.pipeline.emit_status(task_id, serde_json::json!({ "status": "running", "attempt": attempt })).await {
            tracing::warn!(task_id = %task_id, error = %err, "execute: failed to emit running status");
        }

        let logger = TaskLogger::new(self.config.stream_buffer_size, self.config.max_logging_buffer, self.config.logging_buffer_truncation);
        let sinks: Arc<dyn ContextSinks> = Arc::new(SchedulerSinks {
            task_id,
            worker_id: self.config.worker_id.clone(),
            lease_ms: self.config.lease_ms,
            task_repo: self.task_repo.clone(),
            pipeline: self.pipeline.clone(),
        });
        let ctx = TaskContext::new(task_id, attempt, sinks.clone(), logger);
        let logger_limits = (self.config.stream_buffer_size, self.config.max_logging_buffer, self.config.logging_buffer_truncation);
        let dispatcher = Dispatcher::new(self.pool.clone(), sinks, logger_limits);

        let outcome = match task.atomicity {
            Atomicity::Atomic => match self.registry.require(&task.classification) {
                Ok(handler) => dispatcher.invoke(handler, task.input.clone(), task_id, attempt, &ctx).await,
                Err(err) => Err(anyhow::Error::from(err).into()),
            },
            Atomicity::Composite => composite::run(&mut task, &self.registry, self.task_repo.as_ref(), &dispatcher, &ctx).await,
        };

        ctx.flush().await;

        match outcome {
            Ok(output) => self.settle_success(task_id, output).await,
            Err(HandlerOutcome::StateChange(change)) => self.settle_state_change(task_id, change).await,
            Err(HandlerOutcome::Error(err)) => self.settle_error(task_id, err).await,
        }
    }

    async fn settle_success(&self, task_id: Uuid, output: Value) {
        let now = Utc::now();
        let Ok(mut task) = self.task_repo.read(task_id).await else {
            tracing::warn!(task_id = %task_id, "settle_success: task disappeared before persisting success");
            return;
        };
        task.apply_success(output, now);
        if let Err(err) = self.task_repo.update(&task).await {
            tracing::warn!(task_id = %task_id, error = %err, "settle_success: failed to persist");
        }
        if let Err(err) = self.pipeline.emit_status(task_id, serde_json::json!({ "status": "succeeded" })).await {
            tracing::warn!(task_id = %task_id, error = %err, "settle_success: failed to emit status");
        }
    }

    async fn settle_error(&self, task_id: Uuid, err: anyhow::Error) {
        let now = Utc::now();
        let Ok(mut task) = self.task_repo.read(task_id).await else {
            tracing::warn!(task_id = %task_id, "settle_error: task disappeared before persisting failure");
            return;
        };
        let record = ErrorRecord::from_error(&err);

        if task.attempt + 1 < task.max_attempts {
            let delay_ms = compute_backoff_ms(task.attempt + 1, &task.backoff);
            let next_run_at = now + ChronoDuration::milliseconds(delay_ms as i64);
            task.apply_retry(record, next_run_at, now);
            if let Err(err) = self.task_repo.update(&task).await {
                tracing::warn!(task_id = %task_id, error = %err, "settle_error: failed to persist retry");
            }
            let status = task.status.as_str();
            let payload = serde_json::json!({ "status": status, "next_run_at": task.next_run_at, "attempt": task.attempt });
            if let Err(err) = self.pipeline.emit_status(task_id, payload).await {
                tracing::warn!(task_id = %task_id, error = %err, "settle_error: failed to emit status");
            }
        } else {
            task.apply_failure(record, now);
            if let Err(err) = self.task_repo.update(&task).await {
                tracing::warn!(task_id = %task_id, error = %err, "settle_error: failed to persist failure");
            }
            if let Err(err) = self.pipeline.emit_status(task_id, serde_json::json!({ "status": "failed" })).await {
                tracing::warn!(task_id = %task_id, error = %err, "settle_error: failed to emit status");
            }
        }
    }

    async fn settle_state_change(&self, task_id: Uuid, change: StateChangeRequest) {
        let now = Utc::now();
        let Ok(mut task) = self.task_repo.read(task_id).await else {
            tracing::warn!(task_id = %task_id, "settle_state_change: task disappeared before persisting");
            return;
        };

        match change.target {
            StateChangeTarget::Canceled => {
                task.apply_cancel(now);
                if let Some(err) = change.error {
                    task.error = Some(err);
                }
            }
            StateChangeTarget::WaitingRetry => {
                let next_run_at = change.scheduled_to.unwrap_or(now);
                let error = change.error.unwrap_or_else(|| ErrorRecord::new("handler requested retry"));
                task.apply_retry(error, next_run_at, now);
            }
            StateChangeTarget::Scheduled => {
                task.status = TaskStatus::Scheduled;
                task.scheduled_to = Some(change.scheduled_to.unwrap_or(now));
                task.lease_owner = None;
                task.lease_expiry = None;
                if let Some(err) = change.error {
                    task.error = Some(err);
                }
                task.audit.touch(now, None);
                task.version += 1;
            }
        }

        if let Err(err) = self.task_repo.update(&task).await {
            tracing::warn!(task_id = %task_id, error = %err, "settle_state_change: failed to persist");
        }
        let payload = serde_json::json!({ "status": task.status.as_str() });
        if let Err(err) = self.pipeline.emit_status(task_id, payload).await {
            tracing::warn!(task_id = %task_id, error = %err, "settle_state_change: failed to emit status");
        }
    }

    /// Cancel a task (spec.md §4.5.3). A no-op if the task is already
    /// terminal; otherwise clears the lease, marks CANCELED with a
    /// `code: 400` error, persists, and emits STATUS.
    pub async fn cancel(&self, id: Uuid) -> DomainResult<Task> {
        let mut task = self.task_repo.read(id).await?;
        if task.is_terminal() {
            return Ok(task);
        }
        task.apply_cancel(Utc::now());
        self.task_repo.update(&task).await?;
        self.pipeline.emit_status(id, serde_json::json!({ "status": "canceled" })).await?;
        Ok(task)
    }
}
