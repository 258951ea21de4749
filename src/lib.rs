//! Durable, at-least-once background job executor: leased claiming,
//! retry/backoff, composite multi-step tasks, and an in-process event bus.
//!
//! [`Engine`] is the top-level handle a binary builds once at startup: it
//! owns the handler registry, the event bus/pipeline, and the scheduler, and
//! exposes `push`/`push_tracked` for enqueuing work.

pub mod adapters;
pub mod bus;
pub mod composite;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod domain;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod task_logger;
pub mod tracker;

use std::sync::Arc;

use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::domain::errors::DomainResult;
use crate::domain::models::{Event, Task};
use crate::domain::ports::persistence::Repository;
use crate::pipeline::EventPipeline;
use crate::registry::HandlerRegistry;
use crate::scheduler::Scheduler;
use crate::tracker::TaskTracker;

/// Top-level engine handle: wires the registry, bus, pipeline, and scheduler
/// together from an [`EngineConfig`].
pub struct Engine {
    config: EngineConfig,
    task_repo: Arc<dyn Repository<Task>>,
    bus: Arc<EventBus>,
    pipeline: Arc<EventPipeline>,
    scheduler: Arc<Scheduler>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        task_repo: Arc<dyn Repository<Task>>,
        event_repo: Arc<dyn Repository<Event>>,
        registry: HandlerRegistry,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let pipeline = Arc::new(EventPipeline::new(task_repo.clone(), event_repo, bus.clone()));
        let scheduler = Arc::new(Scheduler::new(
            config.to_scheduler_config(),
            task_repo.clone(),
            Arc::new(registry),
            pipeline.clone(),
        ));
        Self { config, task_repo, bus, pipeline, scheduler }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Start the scheduler's poll loop. Returns the loop's join handle; drop
    /// it or detach it, the loop runs until [`Self::stop`] is called.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.scheduler.start()
    }

    /// Stop claiming new work and wait (up to `graceful_shutdown_ms_timeout`)
    /// for in-flight tasks to settle.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Persist `task` and return it. Fire-and-forget: the caller does not
    /// observe the task's eventual outcome (spec.md §4.1 `push`).
    pub async fn push(&self, task: Task) -> DomainResult<Task> {
        self.task_repo.create(&task).await?;
        Ok(task)
    }

    /// Persist `task` and return it alongside a [`TaskTracker`] following its
    /// lifecycle (spec.md §4.1 `push`, Open Question (c): two distinct
    /// methods rather than a variant return type, so callers opt into
    /// tracking instead of always paying for a bus subscription).
    pub async fn push_tracked(&self, task: Task) -> DomainResult<(Task, TaskTracker)> {
        self.task_repo.create(&task).await?;
        let tracker = TaskTracker::new(task.clone(), self.task_repo.clone(), self.bus.clone()).await;
        Ok((task, tracker))
    }

    /// Attach a tracker to an already-pushed task by id.
    pub async fn track(&self, task_id: Uuid) -> DomainResult<TaskTracker> {
        TaskTracker::for_id(task_id, self.task_repo.clone(), self.bus.clone()).await
    }

    /// Request cancellation of a task that has not yet reached a terminal
    /// status.
    pub async fn cancel(&self, task_id: Uuid) -> DomainResult<Task> {
        self.scheduler.cancel(task_id).await
    }
}
