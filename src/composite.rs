//! Composite runner (spec.md §4.6).
//!
//! Drives `task.steps` sequentially from `task.current_step`. Each step
//! result is persisted before the runner moves on (success) or rethrows
//! (failure) — see the "composite-runner exception rethrow" design note:
//! persisting first means a crash between the rethrow and the outer
//! execution path's own persist cannot hide the step failure.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::context::TaskContext;
use crate::dispatch::Dispatcher;
use crate::domain::errors::HandlerOutcome;
use crate::domain::models::{ErrorRecord, StepResult, StepStatus, Task};
use crate::domain::ports::persistence::Repository;
use crate::registry::HandlerRegistry;

fn step_key(task_id: Uuid, index: usize) -> String {
    format!("{task_id}:step:{index}")
}

async fn persist(task_repo: &dyn Repository<Task>, task: &Task) -> Result<(), HandlerOutcome> {
    task_repo.update(task).await.map_err(|err| anyhow::Error::from(err).into())
}

/// Run the composite task to completion (or until a step fails / raises a
/// state change). On entry, pre-populates the context's result cache with
/// the output of every already-succeeded step, so a retried composite skips
/// re-invoking steps `[0..current_step)` (spec.md §8 resumption law).
pub async fn run(
    task: &mut Task,
    registry: &HandlerRegistry,
    task_repo: &dyn Repository<Task>,
    dispatcher: &Dispatcher,
    ctx: &TaskContext,
) -> Result<Value, HandlerOutcome> {
    let total = task.steps.len();

    for (i, result) in task.step_results.iter().enumerate().take(task.current_step) {
        if result.status == StepStatus::Succeeded {
            if let Some(output) = &result.output {
                let classification = task.steps[i].classification.clone();
                ctx.cache_result(classification, output.clone()).await;
                ctx.cache_result(step_key(task.id, i), output.clone()).await;
            }
        }
    }

    while task.current_step < total {
        let i = task.current_step;
        let step = task.steps[i].clone();

        ctx.logger.info(format!("Composite step {}/{total}: {}", i + 1, step.classification));
        ctx.flush().await;

        let handler = registry.require(&step.classification).map_err(|err| anyhow::Error::from(err).into())?;
        let outcome = dispatcher.invoke(handler, step.input.clone(), task.id, ctx.attempt, ctx).await;
        let now = Utc::now();

        match outcome {
            Ok(output) => {
                let result = StepResult::succeeded(output.clone(), now);
                if i < task.step_results.len() {
                    task.step_results[i] = result;
                } else {
                    task.step_results.push(result);
                }
                ctx.cache_result(step.classification.clone(), output.clone()).await;
                ctx.cache_result(step_key(task.id, i), output.clone()).await;
                task.current_step += 1;
                persist(task_repo, task).await?;
                ctx.progress(serde_json::json!({
                    "current_step": task.current_step,
                    "total_steps": total,
                    "output": output,
                }))
                .await;
            }
            Err(HandlerOutcome::Error(err)) => {
                let record = ErrorRecord::from_error(&err);
                let result = StepResult::failed(record, now);
                if i < task.step_results.len() {
                    task.step_results[i] = result;
                } else {
                    task.step_results.push(result);
                }
                persist(task_repo, task).await?;
                return Err(HandlerOutcome::Error(err));
            }
            Err(state_change @ HandlerOutcome::StateChange(_)) => {
                return Err(state_change);
            }
        }
    }

    Ok(task.step_results.last().and_then(|r| r.output.clone()).unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryTaskRepository;
    use crate::context::ContextSinks;
    use crate::domain::models::{LogEntry, StepSpec};
    use crate::registry::Handler;
    use crate::task_logger::TaskLogger;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NullSinks;

    #[async_trait]
    impl ContextSinks for NullSinks {
        async fn heartbeat(&self) -> bool {
            true
        }
        async fn pipe(&self, _entries: Vec<LogEntry>) {}
        async fn progress(&self, _data: Value) {}
    }

    struct Echo(&'static str);

    #[async_trait]
    impl Handler for Echo {
        async fn run(&self, _input: Value, _ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
            Ok(Value::from(self.0))
        }
    }

    struct FlakyOnce {
        classification: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for FlakyOnce {
        async fn run(&self, _input: Value, ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Err(anyhow::anyhow!("boom").into());
            }
            let a = ctx.cached_result("a").await.unwrap_or(Value::Null);
            Ok(serde_json::json!({ "classification": self.classification, "a": a }))
        }
    }

    fn ctx(task_id: Uuid) -> TaskContext {
        TaskContext::new(task_id, 0, Arc::new(NullSinks), TaskLogger::new(10, 100, 10))
    }

    fn inline_dispatcher() -> Dispatcher {
        Dispatcher::new(None, Arc::new(NullSinks), (10, 100, 10))
    }

    #[tokio::test]
    async fn skips_already_succeeded_steps_on_resumption() {
        let task_repo = MemoryTaskRepository::new();
        let mut registry = HandlerRegistry::new();
        registry.register("a", Arc::new(Echo("a-output"))).unwrap();
        registry.register("b", Arc::new(FlakyOnce { classification: "b", calls: AtomicUsize::new(0) })).unwrap();
        let dispatcher = inline_dispatcher();

        let mut task = Task::new_composite(
            "pipeline",
            vec![
                StepSpec { classification: "a".into(), input: Value::Null },
                StepSpec { classification: "b".into(), input: Value::Null },
            ],
        );
        task_repo.create(&task).await.unwrap();

        let c = ctx(task.id);
        let err = run(&mut task, &registry, &task_repo, &dispatcher, &c).await.unwrap_err();
        assert!(matches!(err, HandlerOutcome::Error(_)));
        assert_eq!(task.current_step, 1);
        assert_eq!(task.step_results.len(), 2);
        assert_eq!(task.step_results[0].status, StepStatus::Succeeded);
        assert_eq!(task.step_results[1].status, StepStatus::Failed);

        // Retry: step "a" must not be re-invoked; cache is pre-populated from disk state.
        let c2 = ctx(task.id);
        let output = run(&mut task, &registry, &task_repo, &dispatcher, &c2).await.unwrap();
        assert_eq!(task.current_step, 2);
        assert_eq!(output["classification"], "b");
        assert_eq!(output["a"], "a-output");
    }

    /// A three-step composite where the middle step fails then succeeds on
    /// retry must settle with exactly one result per step, the stale FAILED
    /// entry overwritten in place rather than left behind at its index.
    #[tokio::test]
    async fn retried_step_overwrites_its_stale_failed_result_in_place() {
        let task_repo = MemoryTaskRepository::new();
        let mut registry = HandlerRegistry::new();
        registry.register("a", Arc::new(Echo("a-output"))).unwrap();
        registry.register("b", Arc::new(FlakyOnce { classification: "b", calls: AtomicUsize::new(0) })).unwrap();
        registry.register("c", Arc::new(Echo("c-output"))).unwrap();
        let dispatcher = inline_dispatcher();

        let mut task = Task::new_composite(
            "pipeline",
            vec![
                StepSpec { classification: "a".into(), input: Value::Null },
                StepSpec { classification: "b".into(), input: Value::Null },
                StepSpec { classification: "c".into(), input: Value::Null },
            ],
        );
        task_repo.create(&task).await.unwrap();

        let c1 = ctx(task.id);
        run(&mut task, &registry, &task_repo, &dispatcher, &c1).await.unwrap_err();
        assert_eq!(task.step_results.len(), 2);

        let c2 = ctx(task.id);
        run(&mut task, &registry, &task_repo, &dispatcher, &c2).await.unwrap();

        assert_eq!(task.step_results.len(), 3);
        assert!(task.step_results.iter().all(|r| r.status == StepStatus::Succeeded));
    }
}
