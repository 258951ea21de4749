//! Event pipeline (spec.md §4.7): durable event + log-tail persistence.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::domain::errors::DomainResult;
use crate::domain::models::{Event, EventClassification, LogEntry, Task};
use crate::domain::ports::persistence::Repository;

/// Implements `appendLog`, `emitLog`, `emitProgress`, `emitStatus`
/// (spec.md §4.7). Holds the task/event repositories and the bus so the
/// scheduler, context sinks, and composite runner can all emit through one
/// shared pipeline.
pub struct EventPipeline {
    task_repo: Arc<dyn Repository<Task>>,
    event_repo: Arc<dyn Repository<Event>>,
    bus: Arc<EventBus>,
}

impl EventPipeline {
    pub fn new(task_repo: Arc<dyn Repository<Task>>, event_repo: Arc<dyn Repository<Event>>, bus: Arc<EventBus>) -> Self {
        Self { task_repo, event_repo, bus }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Concatenate `entries` onto `task.logTail`, truncate to the most
    /// recent `logTailMax`, persist. Persistence failure is swallowed: the
    /// log tail is best-effort telemetry, not authoritative (spec.md §4.7).
    pub async fn append_log(&self, task_id: Uuid, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        match self.task_repo.read(task_id).await {
            Ok(mut task) => {
                task.append_log_tail(entries);
                if let Err(err) = self.task_repo.update(&task).await {
                    tracing::warn!(task_id = %task_id, error = %err, "append_log: best-effort persist failed");
                }
            }
            Err(err) => {
                tracing::warn!(task_id = %task_id, error = %err, "append_log: could not read task");
            }
        }
    }

    async fn persist_and_publish(&self, event: Event) -> DomainResult<()> {
        self.event_repo.create(&event).await?;
        self.bus.emit(event).await;
        Ok(())
    }

    /// Persist + publish a LOG event. Note: does *not* touch `logTail` —
    /// callers combine this with [`Self::append_log`] to get the `pipe()`
    /// behavior described in spec.md §4.3.
    pub async fn emit_log(&self, task_id: Uuid, payload: Value) -> DomainResult<()> {
        self.persist_and_publish(Event::new(task_id, EventClassification::Log, payload)).await
    }

    pub async fn emit_progress(&self, task_id: Uuid, payload: Value) -> DomainResult<()> {
        self.persist_and_publish(Event::new(task_id, EventClassification::Progress, payload)).await
    }

    /// Persist + publish a STATUS event. Callers must flush the executing
    /// context's logger before calling this so LOG events precede the
    /// STATUS event they belong to (spec.md §4.7, §5 ordering guarantee b).
    pub async fn emit_status(&self, task_id: Uuid, payload: Value) -> DomainResult<()> {
        self.persist_and_publish(Event::new(task_id, EventClassification::Status, payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryEventRepository, MemoryTaskRepository};
    use serde_json::json;

    fn pipeline() -> (EventPipeline, Arc<MemoryTaskRepository>) {
        let task_repo = Arc::new(MemoryTaskRepository::new());
        let event_repo = Arc::new(MemoryEventRepository::new());
        let bus = Arc::new(EventBus::new());
        (EventPipeline::new(task_repo.clone(), event_repo, bus), task_repo)
    }

    #[tokio::test]
    async fn append_log_truncates_and_persists() {
        let (pipeline, task_repo) = pipeline();
        let task = crate::domain::models::Task::new_atomic("double", json!(1)).with_log_tail_max(2);
        task_repo.create(&task).await.unwrap();

        let entries: Vec<LogEntry> = (0..5)
            .map(|i| LogEntry { ts: chrono::Utc::now(), level: crate::domain::models::LogLevel::Info, msg: format!("l{i}"), meta: None })
            .collect();
        pipeline.append_log(task.id, entries).await;

        let reloaded = task_repo.read(task.id).await.unwrap();
        assert_eq!(reloaded.log_tail.len(), 2);
        assert_eq!(reloaded.log_tail[1].msg, "l4");
    }

    #[tokio::test]
    async fn emit_status_persists_and_publishes() {
        let (pipeline, task_repo) = pipeline();
        let task = crate::domain::models::Task::new_atomic("double", json!(1));
        task_repo.create(&task).await.unwrap();

        pipeline.emit_status(task.id, json!({"status": "running"})).await.unwrap();
        // No subscribers yet; just check persistence succeeded without panicking.
    }
}
