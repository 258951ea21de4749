//! Task Context (spec.md §4.3).
//!
//! A scoped, read-mostly handle passed to handlers. Built fresh for every
//! execution attempt; it inherits no cross-attempt state beyond what it
//! reads from the `Task` record at construction time (REDESIGN FLAGS §9:
//! explicit parameter, not an ambient accumulated bag).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::models::LogEntry;
use crate::task_logger::TaskLogger;

/// Engine-provided callbacks a [`TaskContext`] forwards to. The scheduler
/// implements this once per claim and wires it to the event pipeline, the
/// task repository, and the active lease.
#[async_trait]
pub trait ContextSinks: Send + Sync {
    /// Extend the owning lease if the caller still owns the claim
    /// (spec.md §4.3 `heartbeat`). Returns whether the lease was extended.
    async fn heartbeat(&self) -> bool;

    /// Append a batch of log entries to persistence and emit a LOG event
    /// (spec.md §4.3 `pipe`).
    async fn pipe(&self, entries: Vec<LogEntry>);

    /// Emit a PROGRESS event (spec.md §4.3 `progress`).
    async fn progress(&self, data: Value);
}

/// Per-execution ambient state handed to a [`crate::registry::Handler`].
pub struct TaskContext {
    pub task_id: Uuid,
    pub attempt: u32,
    pub logger: TaskLogger,
    sinks: Arc<dyn ContextSinks>,
    result_cache: Arc<Mutex<HashMap<String, Value>>>,
}

impl TaskContext {
    pub fn new(task_id: Uuid, attempt: u32, sinks: Arc<dyn ContextSinks>, logger: TaskLogger) -> Self {
        Self {
            task_id,
            attempt,
            logger,
            sinks,
            result_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Share one result cache across an execution (used by the composite
    /// runner so steps within one attempt see each other's cached outputs).
    pub fn with_shared_cache(mut self, cache: Arc<Mutex<HashMap<String, Value>>>) -> Self {
        self.result_cache = cache;
        self
    }

    /// Emit a PROGRESS event.
    pub async fn progress(&self, data: Value) {
        self.sinks.progress(data).await;
    }

    /// Extend the owning lease if the caller still owns the claim.
    pub async fn heartbeat(&self) -> bool {
        self.sinks.heartbeat().await
    }

    /// Append a batch of log entries to persistence and emit a LOG event.
    pub async fn pipe(&self, entries: Vec<LogEntry>) {
        self.sinks.pipe(entries).await;
    }

    /// Drain the logger through `pipe`.
    pub async fn flush(&self) {
        let entries = self.logger.drain();
        if !entries.is_empty() {
            self.pipe(entries).await;
        }
    }

    /// Cache a value under `key`, visible to subsequent composite steps
    /// within the same execution.
    pub async fn cache_result(&self, key: impl Into<String>, value: Value) {
        self.result_cache.lock().await.insert(key.into(), value);
    }

    pub async fn cached_result(&self, key: &str) -> Option<Value> {
        self.result_cache.lock().await.get(key).cloned()
    }

    pub fn result_cache_handle(&self) -> Arc<Mutex<HashMap<String, Value>>> {
        self.result_cache.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSinks {
        heartbeats: AtomicUsize,
    }

    #[async_trait]
    impl ContextSinks for NullSinks {
        async fn heartbeat(&self) -> bool {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn pipe(&self, _entries: Vec<LogEntry>) {}
        async fn progress(&self, _data: Value) {}
    }

    #[tokio::test]
    async fn cache_result_round_trips() {
        let sinks = Arc::new(NullSinks { heartbeats: AtomicUsize::new(0) });
        let ctx = TaskContext::new(Uuid::new_v4(), 0, sinks, TaskLogger::new(10, 20, 5));
        ctx.cache_result("k", Value::from(42)).await;
        assert_eq!(ctx.cached_result("k").await, Some(Value::from(42)));
        assert_eq!(ctx.cached_result("missing").await, None);
    }

    #[tokio::test]
    async fn heartbeat_forwards_to_sinks() {
        let sinks = Arc::new(NullSinks { heartbeats: AtomicUsize::new(0) });
        let ctx = TaskContext::new(Uuid::new_v4(), 0, sinks.clone(), TaskLogger::new(10, 20, 5));
        assert!(ctx.heartbeat().await);
        assert_eq!(sinks.heartbeats.load(Ordering::SeqCst), 1);
    }
}
