//! Task Tracker (spec.md §4.9).
//!
//! A `TaskTracker` follows one task's lifecycle by subscribing to the bus
//! with a `task_filter`. On every STATUS event it re-reads the task from the
//! repository (rather than trusting the event payload alone) and republishes
//! the latest copy on a `tokio::sync::watch` channel, so `wait`/`resolve`
//! and the `on_*` hooks never race a missed notification.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::bus::{task_filter, EventBus, Observer, SubscriptionId};
use crate::domain::errors::{ControlError, DomainResult};
use crate::domain::models::{Event, EventClassification, Task, TaskStatus};
use crate::domain::ports::persistence::Repository;

struct TrackerObserver {
    task_id: Uuid,
    task_repo: Arc<dyn Repository<Task>>,
    sender: Arc<watch::Sender<Task>>,
}

#[async_trait]
impl Observer for TrackerObserver {
    async fn refresh(&self, event: &Event) {
        if event.classification != EventClassification::Status {
            return;
        }
        if let Ok(latest) = self.task_repo.read(self.task_id).await {
            let _ = self.sender.send(latest);
        }
    }
}

/// Follows a single task from claim to terminal status.
pub struct TaskTracker {
    task_id: Uuid,
    bus: Arc<EventBus>,
    receiver: watch::Receiver<Task>,
    subscription: SubscriptionId,
}

impl TaskTracker {
    /// Attach to `task`'s lifecycle starting from its current snapshot.
    pub async fn new(task: Task, task_repo: Arc<dyn Repository<Task>>, bus: Arc<EventBus>) -> Self {
        let task_id = task.id;
        let (sender, receiver) = watch::channel(task);
        let sender = Arc::new(sender);
        let observer: Arc<dyn Observer> = Arc::new(TrackerObserver { task_id, task_repo, sender });
        let subscription = bus.subscribe(observer, Some(task_filter(task_id))).await;
        Self { task_id, bus, receiver, subscription }
    }

    /// Read the task fresh from `task_repo` and attach to it.
    pub async fn for_id(task_id: Uuid, task_repo: Arc<dyn Repository<Task>>, bus: Arc<EventBus>) -> DomainResult<Self> {
        let task = task_repo.read(task_id).await?;
        Ok(Self::new(task, task_repo, bus).await)
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// The most recently observed snapshot of the task.
    pub fn current(&self) -> Task {
        self.receiver.borrow().clone()
    }

    /// Wait until the task reaches any terminal status (SUCCEEDED, FAILED,
    /// or CANCELED). Unlike [`Self::resolve`], SCHEDULED and WAITING_RETRY
    /// do not settle the wait — it keeps waiting for the task's eventual
    /// terminal outcome (spec.md §4.9).
    pub async fn wait(&self) -> Task {
        let mut rx = self.receiver.clone();
        loop {
            {
                let task = rx.borrow();
                if task.is_terminal() {
                    return task.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Settle on the first of SUCCEEDED, FAILED, CANCELED, or SCHEDULED
    /// (spec.md §4.9). SUCCEEDED resolves with the task's output; the other
    /// three reject with a typed [`ControlError`] carrying `task_id`,
    /// `details`, and (for the reschedule/retry cases) a `meta` hint such as
    /// the task's `next_run_at`.
    pub async fn resolve(&self) -> Result<Value, ControlError> {
        let mut rx = self.receiver.clone();
        loop {
            {
                let task = rx.borrow();
                match task.status {
                    TaskStatus::Succeeded => return Ok(task.output.clone().unwrap_or(Value::Null)),
                    TaskStatus::Failed => {
                        return Err(ControlError::TaskFailError {
                            task_id: task.id,
                            details: task.error.as_ref().map(|e| e.message.clone()),
                            next_action: task.status,
                        })
                    }
                    TaskStatus::Canceled => {
                        return Err(ControlError::TaskCancelError {
                            task_id: task.id,
                            details: task.error.as_ref().map(|e| e.message.clone()),
                            next_action: task.status,
                        })
                    }
                    TaskStatus::Scheduled => {
                        return Err(ControlError::TaskRescheduleError {
                            task_id: task.id,
                            details: task.error.as_ref().map(|e| e.message.clone()),
                            meta: task.scheduled_to.map(|t| t.to_rfc3339()),
                            next_action: task.status,
                        })
                    }
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                let task = rx.borrow();
                return Err(ControlError::TaskFailError {
                    task_id: task.id,
                    details: Some("tracker subscription ended before a terminal status was observed".to_string()),
                    next_action: task.status,
                });
            }
        }
    }

    fn spawn_once(
        &self,
        predicate: impl Fn(&Task) -> bool + Send + 'static,
        handler: impl FnOnce(&Task) + Send + 'static,
    ) {
        let mut rx = self.receiver.clone();
        tokio::spawn(async move {
            loop {
                {
                    let task = rx.borrow();
                    if predicate(&task) {
                        handler(&task);
                        return;
                    }
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Invoke `handler` once the task reaches SUCCEEDED (immediately, if it
    /// already has by the time this is called).
    pub fn on_succeed(&self, handler: impl FnOnce(&Task) + Send + 'static) {
        self.spawn_once(|t| t.status == TaskStatus::Succeeded, handler);
    }

    pub fn on_failure(&self, handler: impl FnOnce(&Task) + Send + 'static) {
        self.spawn_once(|t| t.status == TaskStatus::Failed, handler);
    }

    pub fn on_cancel(&self, handler: impl FnOnce(&Task) + Send + 'static) {
        self.spawn_once(|t| t.status == TaskStatus::Canceled, handler);
    }

    /// Subscribe a raw sink to every LOG/PROGRESS/STATUS event for this
    /// task, independent of the terminal-settling logic above.
    pub async fn logs(&self, sink: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionId {
        struct LogForwarder<F>(F);

        #[async_trait]
        impl<F: Fn(&Event) + Send + Sync> Observer for LogForwarder<F> {
            async fn refresh(&self, event: &Event) {
                (self.0)(event);
            }
        }

        let observer: Arc<dyn Observer> = Arc::new(LogForwarder(sink));
        self.bus.subscribe(observer, Some(task_filter(self.task_id))).await
    }

    /// Pipe every event for this task through `logger` (spec.md §4.9
    /// `attach`), grounded on the [`crate::domain::ports::Logger`] port.
    pub async fn attach(&self, logger: Arc<dyn crate::domain::ports::Logger>) -> SubscriptionId {
        self.logs(move |event| {
            let line = match event.classification {
                EventClassification::Log => format!("log {}", event.payload),
                EventClassification::Status => format!("status {}", event.payload),
                EventClassification::Progress => format!("progress {}", event.payload),
            };
            logger.info(&line);
        })
        .await
    }

    /// Detach from the bus. Dropping the tracker without calling this leaves
    /// the subscription registered until the bus itself is dropped.
    pub async fn unsubscribe(self) {
        self.bus.unsubscribe(self.subscription).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryTaskRepository;
    use crate::domain::models::Task;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    async fn setup() -> (Arc<MemoryTaskRepository>, Arc<EventBus>, Task) {
        let task_repo = Arc::new(MemoryTaskRepository::new());
        let bus = Arc::new(EventBus::new());
        let task = Task::new_atomic("double", json!(7));
        task_repo.create(&task).await.unwrap();
        (task_repo, bus, task)
    }

    #[tokio::test]
    async fn wait_settles_on_success() {
        let (task_repo, bus, task) = setup().await;
        let tracker = TaskTracker::new(task.clone(), task_repo.clone(), bus.clone()).await;

        let mut succeeded = task.clone();
        succeeded.apply_success(json!(14), chrono::Utc::now());
        task_repo.update(&succeeded).await.unwrap();
        bus.emit(Event::new(task.id, EventClassification::Status, json!({"status": "succeeded"}))).await;

        let settled = tracker.wait().await;
        assert_eq!(settled.status, TaskStatus::Succeeded);
        assert_eq!(settled.output, Some(json!(14)));
    }

    #[tokio::test]
    async fn resolve_rejects_on_failure_with_control_error() {
        let (task_repo, bus, task) = setup().await;
        let tracker = TaskTracker::new(task.clone(), task_repo.clone(), bus.clone()).await;

        let mut failed = task.clone();
        failed.apply_failure(crate::domain::models::ErrorRecord::new("boom"), chrono::Utc::now());
        task_repo.update(&failed).await.unwrap();
        bus.emit(Event::new(task.id, EventClassification::Status, json!({"status": "failed"}))).await;

        let err = tracker.resolve().await.unwrap_err();
        assert!(matches!(err, ControlError::TaskFailError { .. }));
    }

    #[tokio::test]
    async fn on_succeed_fires_when_already_terminal() {
        let (task_repo, bus, task) = setup().await;
        let mut succeeded = task.clone();
        succeeded.apply_success(json!(14), chrono::Utc::now());
        task_repo.update(&succeeded).await.unwrap();

        let tracker = TaskTracker::new(succeeded, task_repo, bus).await;
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tracker.on_succeed(move |_task| flag.store(true, Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
