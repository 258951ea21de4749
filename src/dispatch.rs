//! Handler dispatch (spec.md §4.8): routes one handler invocation either
//! inline, on the caller's task, or onto a [`crate::pool::WorkerPool`].
//!
//! Both paths share the same [`TaskContext`] result cache: a pooled
//! invocation is handed the caller's cache `Arc`, so whatever the worker
//! caches during the run is already visible to the caller once the job
//! completes — no separate replay step is needed.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::context::{ContextSinks, TaskContext};
use crate::domain::errors::HandlerOutcome;
use crate::pool::{Job, WorkerPool};
use crate::registry::Handler;

/// Chooses inline-vs-pool execution for every handler invocation a
/// [`crate::scheduler::Scheduler`] makes, atomic or within a composite step.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Option<Arc<WorkerPool>>,
    sinks: Arc<dyn ContextSinks>,
    logger_limits: (usize, usize, usize),
}

impl Dispatcher {
    pub fn new(pool: Option<Arc<WorkerPool>>, sinks: Arc<dyn ContextSinks>, logger_limits: (usize, usize, usize)) -> Self {
        Self { pool, sinks, logger_limits }
    }

    /// Run `handler` with `input`, inline if no pool is configured, otherwise
    /// as a [`Job`] submitted to the pool.
    pub async fn invoke(&self, handler: Arc<dyn Handler>, input: Value, task_id: Uuid, attempt: u32, ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
        let Some(pool) = &self.pool else {
            return handler.run(input, ctx).await;
        };

        let (respond_to, response) = oneshot::channel();
        let job = Job {
            handler,
            input,
            task_id,
            attempt,
            sinks: self.sinks.clone(),
            logger_limits: self.logger_limits,
            cache: ctx.result_cache_handle(),
            respond_to,
        };
        pool.submit(job).await;
        response.await.unwrap_or_else(|_| Err(anyhow::anyhow!("worker pool dropped job without responding").into()))
    }
}
