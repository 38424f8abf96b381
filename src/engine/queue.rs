// Bounded worker pools for queued engine work

//! # Task Queues
//!
//! Event processing, child-schema triggers and timer firings all run through
//! a [`WorkerPool`]: `enqueue` pushes onto an unbounded channel and returns
//! immediately, a dispatcher task pops items in FIFO order and runs each one
//! on its own task while holding a semaphore permit, so at most
//! `concurrency` items are processed at once.
//!
//! Every item gets a deadline. A handler error or a deadline overrun is
//! logged and persisted as a [`DeadLetter`]; it never stops the pool.
//! Items failing with `Cancelled` belong to terminated instances and are
//! only logged.
//!
//! ## Lifecycle
//!
//! ```text
//! TaskQueue::channel() ──▶ (TaskQueue, QueueReceiver)
//!                                      │
//!                  WorkerPool::start(receiver, handler)
//!                                      │
//!                     drain() ── waits until nothing is pending
//!                  shutdown() ── drain, then stop the dispatcher
//! ```
//!
//! The queue handle is created before the pool so handlers can hold
//! handles to other pools (timer handlers enqueue child triggers and so on).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::storage::WorkflowStorage;
use crate::models::DeadLetter;
use crate::{FlowgateError, Result};

/// Something that can travel through a [`WorkerPool`]
pub trait QueueTask: Serialize + Send + Sync + 'static {
    /// Instance the task belongs to, recorded on dead letters
    fn schema_instance_id(&self) -> Option<Uuid>;
}

#[async_trait]
pub trait TaskHandler<T: QueueTask>: Send + Sync + 'static {
    async fn handle(&self, task: T) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub pending: usize,
    pub processed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
}

impl Counters {
    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Cloneable producer side of a queue
pub struct TaskQueue<T> {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<T>,
    counters: Arc<Counters>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            counters: self.counters.clone(),
        }
    }
}

/// Consumer side, handed to [`WorkerPool::start`]
pub struct QueueReceiver<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    counters: Arc<Counters>,
    name: Arc<str>,
}

impl<T: QueueTask> TaskQueue<T> {
    pub fn channel(name: &str) -> (TaskQueue<T>, QueueReceiver<T>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let name: Arc<str> = Arc::from(name);
        (
            TaskQueue {
                name: name.clone(),
                sender,
                counters: counters.clone(),
            },
            QueueReceiver {
                receiver,
                counters,
                name,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push a task without waiting for it to run
    pub fn enqueue(&self, task: T) -> Result<()> {
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(task).is_err() {
            self.counters.finish();
            return Err(FlowgateError::Internal(format!("queue '{}' is shut down", self.name)));
        }
        debug!(queue = %self.name, "Task enqueued");
        Ok(())
    }

    /// Wait until every enqueued task has finished
    pub async fn drain(&self) {
        loop {
            let idle = self.counters.idle.notified();
            if self.counters.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.to_string(),
            pending: self.counters.pending.load(Ordering::SeqCst),
            processed: self.counters.processed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }
}

pub struct WorkerPool<T: QueueTask> {
    queue: TaskQueue<T>,
    stop: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: QueueTask> WorkerPool<T> {
    /// Spawn the dispatcher for `receiver`
    pub fn start(
        queue: TaskQueue<T>,
        receiver: QueueReceiver<T>,
        handler: Arc<dyn TaskHandler<T>>,
        storage: Arc<dyn WorkflowStorage>,
        concurrency: usize,
        deadline: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(
            receiver,
            handler,
            storage,
            Arc::new(Semaphore::new(concurrency.max(1))),
            deadline,
            stop.clone(),
        ));
        info!(queue = %queue.name(), concurrency, "Worker pool started");
        Self {
            queue,
            stop,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn queue(&self) -> &TaskQueue<T> {
        &self.queue
    }

    pub fn enqueue(&self, task: T) -> Result<()> {
        self.queue.enqueue(task)
    }

    pub async fn drain(&self) {
        self.queue.drain().await
    }

    /// Drain outstanding work, then stop the dispatcher
    pub async fn shutdown(&self) {
        self.drain().await;
        self.stop.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(queue = %self.queue.name(), error = %e, "Dispatcher ended abnormally");
            }
        }
        info!(queue = %self.queue.name(), "Worker pool stopped");
    }
}

async fn dispatch<T: QueueTask>(
    mut receiver: QueueReceiver<T>,
    handler: Arc<dyn TaskHandler<T>>,
    storage: Arc<dyn WorkflowStorage>,
    permits: Arc<Semaphore>,
    deadline: Duration,
    stop: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            _ = stop.cancelled() => break,
            task = receiver.receiver.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let handler = handler.clone();
        let storage = storage.clone();
        let counters = receiver.counters.clone();
        let name = receiver.name.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_task(&name, task, handler, storage, deadline, &counters).await;
            counters.finish();
        });
    }
}

async fn run_task<T: QueueTask>(
    queue: &str,
    task: T,
    handler: Arc<dyn TaskHandler<T>>,
    storage: Arc<dyn WorkflowStorage>,
    deadline: Duration,
    counters: &Counters,
) {
    let schema_instance_id = task.schema_instance_id();
    let payload = serde_json::to_value(&task).unwrap_or(Value::Null);

    let failure = match tokio::time::timeout(deadline, handler.handle(task)).await {
        Ok(Ok(())) => None,
        Ok(Err(FlowgateError::Cancelled(reason))) => {
            debug!(queue, reason = %reason, "Task cancelled");
            None
        }
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(FlowgateError::Timeout(format!("task exceeded {:?}", deadline)).to_string()),
    };
    counters.processed.fetch_add(1, Ordering::SeqCst);

    let Some(reason) = failure else {
        return;
    };
    counters.failed.fetch_add(1, Ordering::SeqCst);
    error!(queue, schema_instance_id = ?schema_instance_id, error = %reason, "Queued task failed");

    let mut dead_letter = DeadLetter::new(queue, payload, reason);
    dead_letter.schema_instance_id = schema_instance_id;
    if let Err(e) = storage.record_dead_letter(dead_letter).await {
        error!(queue, error = %e, "Failed to record dead letter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Clone, Serialize)]
    struct Job {
        id: u32,
        fail: bool,
        sleep_ms: u64,
    }

    impl QueueTask for Job {
        fn schema_instance_id(&self) -> Option<Uuid> {
            None
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        overlapped: AtomicBool,
    }

    #[async_trait]
    impl TaskHandler<Job> for Recorder {
        async fn handle(&self, job: Job) -> Result<()> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            if running > 1 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(job.sleep_ms)).await;
            self.seen.lock().await.push(job.id);
            self.running.fetch_sub(1, Ordering::SeqCst);
            if job.fail {
                return Err(FlowgateError::Internal(format!("job {} failed", job.id)));
            }
            Ok(())
        }
    }

    fn pool(
        handler: Arc<Recorder>,
        storage: Arc<dyn WorkflowStorage>,
        concurrency: usize,
        deadline: Duration,
    ) -> WorkerPool<Job> {
        let (queue, receiver) = TaskQueue::channel("jobs");
        WorkerPool::start(queue, receiver, handler, storage, concurrency, deadline)
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let handler = Arc::new(Recorder::default());
        let pool = pool(handler.clone(), storage, 2, Duration::from_secs(5));

        for id in 0..6 {
            pool.enqueue(Job { id, fail: false, sleep_ms: 20 }).unwrap();
        }
        pool.drain().await;

        assert_eq!(handler.seen.lock().await.len(), 6);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert!(handler.overlapped.load(Ordering::SeqCst));
        assert_eq!(pool.queue().stats().processed, 6);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_are_dead_lettered_and_isolated() {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let handler = Arc::new(Recorder::default());
        let pool = pool(handler.clone(), storage.clone(), 4, Duration::from_secs(5));

        pool.enqueue(Job { id: 1, fail: true, sleep_ms: 0 }).unwrap();
        pool.enqueue(Job { id: 2, fail: false, sleep_ms: 0 }).unwrap();
        pool.drain().await;

        let dead = storage.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].queue, "jobs");
        assert!(dead[0].error.contains("job 1 failed"));
        assert_eq!(handler.seen.lock().await.len(), 2);
        assert_eq!(pool.queue().stats().failed, 1);
    }

    #[tokio::test]
    async fn test_deadline_overrun_is_dead_lettered() {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let handler = Arc::new(Recorder::default());
        let pool = pool(handler, storage.clone(), 1, Duration::from_millis(10));

        pool.enqueue(Job { id: 7, fail: false, sleep_ms: 200 }).unwrap();
        pool.drain().await;

        let dead = storage.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("Timed out"));
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let pool = pool(Arc::new(Recorder::default()), storage, 1, Duration::from_secs(1));
        pool.shutdown().await;

        assert!(pool.enqueue(Job { id: 1, fail: false, sleep_ms: 0 }).is_err());
        assert_eq!(pool.queue().stats().pending, 0);
    }
}
