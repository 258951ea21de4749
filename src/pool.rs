//! Worker-thread pool (spec.md §4.8, optional).
//!
//! A fixed set of `tokio::task`s draining a shared job queue, the in-process
//! analogue of a worker-process protocol (`execute`/`ready`/`log`/
//! `progress`/`heartbeat`/`result`/`error`). A plain `mpsc::Receiver` cannot
//! express "requeue to the head of the queue" on a crashed job, so the queue
//! here is a `Mutex<VecDeque<Job>>` paired with a `Notify`, guarded the way
//! `EventBus` guards its subscriber list with an async lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify};
use uuid::Uuid;

use crate::context::{ContextSinks, TaskContext};
use crate::domain::errors::HandlerOutcome;
use crate::registry::Handler;
use crate::task_logger::TaskLogger;

/// One unit of work dispatched to the pool: a handler invocation plus enough
/// state to rebuild a fresh [`TaskContext`] if the job has to be retried
/// after a crashed worker.
pub struct Job {
    pub handler: Arc<dyn Handler>,
    pub input: Value,
    pub task_id: Uuid,
    pub attempt: u32,
    pub sinks: Arc<dyn ContextSinks>,
    pub logger_limits: (usize, usize, usize),
    /// The caller's result cache. The worker builds its [`TaskContext`] on
    /// this same `Arc`, so anything the handler caches is already visible to
    /// the caller once the job completes — no separate replay step needed.
    pub cache: Arc<Mutex<HashMap<String, Value>>>,
    pub respond_to: oneshot::Sender<Result<Value, HandlerOutcome>>,
}

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl Queue {
    fn new() -> Self {
        Self { jobs: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    async fn push_back(&self, job: Job) {
        self.jobs.lock().await.push_back(job);
        self.notify.notify_one();
    }

    async fn push_front(&self, job: Job) {
        self.jobs.lock().await.push_front(job);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Job {
        loop {
            if let Some(job) = self.jobs.lock().await.pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }
}

/// A fixed-size pool of worker tasks.
pub struct WorkerPool {
    queue: Arc<Queue>,
    running: Arc<AtomicBool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker tasks, each looping on the shared queue until
    /// [`Self::shutdown`] is called.
    pub fn spawn(size: usize) -> Self {
        let queue = Arc::new(Queue::new());
        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::with_capacity(size);

        for _ in 0..size {
            let queue = queue.clone();
            let running = running.clone();
            handles.push(tokio::spawn(worker_loop(queue, running)));
        }

        Self { queue, running, handles }
    }

    /// Enqueue a job at the tail of the queue.
    pub async fn submit(&self, job: Job) {
        self.queue.push_back(job).await;
    }

    /// Stop accepting new dispatch and wait for in-flight workers to drain
    /// their current job.
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.notify.notify_waiters();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(queue: Arc<Queue>, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }

        let job = tokio::select! {
            job = queue.pop() => job,
            () = async {
                while running.load(Ordering::SeqCst) {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            } => return,
        };

        let Job { handler, input, task_id, attempt, sinks, logger_limits, cache, respond_to } = job;
        let retry_handler = handler.clone();
        let retry_input = input.clone();
        let retry_sinks = sinks.clone();
        let retry_cache = cache.clone();

        let outcome = tokio::spawn(async move {
            let logger = TaskLogger::new(logger_limits.0, logger_limits.1, logger_limits.2);
            let ctx = TaskContext::new(task_id, attempt, sinks, logger).with_shared_cache(cache);
            let result = handler.run(input, &ctx).await;
            ctx.flush().await;
            result
        })
        .await;

        match outcome {
            Ok(result) => {
                let _ = respond_to.send(result);
            }
            Err(join_err) => {
                tracing::error!(task_id = %task_id, error = %join_err, "worker panicked, requeueing job");
                let retry_job = Job {
                    handler: retry_handler,
                    input: retry_input,
                    task_id,
                    attempt,
                    sinks: retry_sinks,
                    logger_limits,
                    cache: retry_cache,
                    respond_to,
                };
                queue.push_front(retry_job).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Double;

    #[async_trait]
    impl Handler for Double {
        async fn run(&self, input: Value, _ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
            Ok(Value::from(input.as_i64().unwrap_or(0) * 2))
        }
    }

    struct NullSinks;

    #[async_trait]
    impl ContextSinks for NullSinks {
        async fn heartbeat(&self) -> bool {
            true
        }
        async fn pipe(&self, _entries: Vec<crate::domain::models::LogEntry>) {}
        async fn progress(&self, _data: Value) {}
    }

    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for PanicsOnce {
        async fn run(&self, _input: Value, _ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("simulated worker crash");
            }
            Ok(Value::from("recovered"))
        }
    }

    #[tokio::test]
    async fn dispatches_job_and_returns_result() {
        let pool = WorkerPool::spawn(2);
        let (tx, rx) = oneshot::channel();
        pool.submit(Job {
            handler: Arc::new(Double),
            input: json!(21),
            task_id: Uuid::new_v4(),
            attempt: 1,
            sinks: Arc::new(NullSinks),
            logger_limits: (10, 20, 5),
            cache: Arc::new(Mutex::new(HashMap::new())),
            respond_to: tx,
        })
        .await;

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, json!(42));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn crashed_job_is_requeued_and_eventually_succeeds() {
        let pool = WorkerPool::spawn(1);
        let (tx, rx) = oneshot::channel();
        pool.submit(Job {
            handler: Arc::new(PanicsOnce { calls: AtomicUsize::new(0) }),
            input: Value::Null,
            task_id: Uuid::new_v4(),
            attempt: 1,
            sinks: Arc::new(NullSinks),
            logger_limits: (10, 20, 5),
            cache: Arc::new(Mutex::new(HashMap::new())),
            respond_to: tx,
        })
        .await;

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, json!("recovered"));
        pool.shutdown().await;
    }

    struct CachesValue;

    #[async_trait]
    impl Handler for CachesValue {
        async fn run(&self, _input: Value, ctx: &TaskContext) -> Result<Value, HandlerOutcome> {
            ctx.cache_result("k", json!("from-worker")).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn caller_cache_sees_what_the_worker_cached() {
        let pool = WorkerPool::spawn(1);
        let cache = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pool.submit(Job {
            handler: Arc::new(CachesValue),
            input: Value::Null,
            task_id: Uuid::new_v4(),
            attempt: 1,
            sinks: Arc::new(NullSinks),
            logger_limits: (10, 20, 5),
            cache: cache.clone(),
            respond_to: tx,
        })
        .await;

        rx.await.unwrap().unwrap();
        assert_eq!(cache.lock().await.get("k"), Some(&json!("from-worker")));
        pool.shutdown().await;
    }
}
