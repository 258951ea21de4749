//! Composite mid-step-failure scenario (spec.md §8 scenario 5).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use task_engine::adapters::memory::{MemoryEventRepository, MemoryTaskRepository};
use task_engine::context::TaskContext;
use task_engine::domain::errors::HandlerOutcome;
use task_engine::domain::models::{StepSpec, StepStatus, Task, TaskStatus};
use task_engine::domain::ports::persistence::Repository;
use task_engine::pipeline::EventPipeline;
use task_engine::registry::{Handler, HandlerRegistry};
use task_engine::scheduler::{Scheduler, SchedulerConfig};

struct StepA;

#[async_trait]
impl Handler for StepA {
    async fn run(&self, _input: Value, _ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
        Ok(json!("a"))
    }
}

struct StepB {
    calls: AtomicUsize,
}

#[async_trait]
impl Handler for StepB {
    async fn run(&self, _input: Value, _ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(anyhow::anyhow!("b failed").into());
        }
        Ok(json!("b"))
    }
}

struct StepC;

#[async_trait]
impl Handler for StepC {
    async fn run(&self, _input: Value, ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
        let a = ctx.cached_result("a").await;
        Ok(json!({ "c": "c", "saw_a": a }))
    }
}

#[tokio::test]
async fn composite_mid_step_failure_then_resumes() {
    let mut registry = HandlerRegistry::new();
    registry.register("a", Arc::new(StepA)).unwrap();
    registry.register("b", Arc::new(StepB { calls: AtomicUsize::new(0) })).unwrap();
    registry.register("c", Arc::new(StepC)).unwrap();

    let task_repo = Arc::new(MemoryTaskRepository::new());
    let event_repo = Arc::new(MemoryEventRepository::new());
    let pipeline = Arc::new(EventPipeline::new(task_repo.clone(), event_repo, Arc::new(task_engine::bus::EventBus::new())));
    let config = SchedulerConfig::new("worker-1");
    let scheduler = Scheduler::new(config, task_repo.clone(), Arc::new(registry), pipeline);

    let task = Task::new_composite(
        "pipeline",
        vec![
            StepSpec { classification: "a".into(), input: Value::Null },
            StepSpec { classification: "b".into(), input: Value::Null },
            StepSpec { classification: "c".into(), input: Value::Null },
        ],
    )
    .with_max_attempts(3);
    task_repo.create(&task).await.unwrap();

    scheduler.tick().await;
    let after_first = task_repo.read(task.id).await.unwrap();
    assert_eq!(after_first.status, TaskStatus::WaitingRetry);
    assert_eq!(after_first.current_step, 1);
    assert_eq!(after_first.step_results.len(), 2);
    assert_eq!(after_first.step_results[0].status, StepStatus::Succeeded);
    assert_eq!(after_first.step_results[0].output, Some(json!("a")));
    assert_eq!(after_first.step_results[1].status, StepStatus::Failed);

    // Force the retry due immediately.
    let mut runnable = after_first.clone();
    runnable.next_run_at = Some(chrono::Utc::now());
    runnable.version += 1;
    task_repo.update(&runnable).await.unwrap();

    scheduler.tick().await;
    let settled = task_repo.read(task.id).await.unwrap();
    assert_eq!(settled.status, TaskStatus::Succeeded);
    assert_eq!(settled.current_step, 3);
    assert_eq!(settled.step_results.len(), 3);
    assert!(settled.step_results.iter().all(|r| r.status == StepStatus::Succeeded));
    // Step A was not re-invoked: its recorded output is unchanged.
    assert_eq!(settled.step_results[0].output, Some(json!("a")));
    // Step C observed step A's cached output.
    assert_eq!(settled.step_results[2].output, Some(json!({ "c": "c", "saw_a": "a" })));
}
