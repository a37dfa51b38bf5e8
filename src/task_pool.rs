//! In-process task engine with typed executors, retries and bounded concurrency.
//!
//! Tasks are JSON payloads tagged with a task type. The processor looks up the
//! executor registered for that type and runs it on a [`WorkerPool`], so no
//! more than `concurrency_factor` tasks execute at once. Failed attempts are
//! retried with exponential backoff up to the task's `max_retry`; a
//! [`TaskError::SkipRetry`], for example from an undecodable payload, fails the
//! task immediately.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use rs_sqs_worker::errors::TaskError;
//! use rs_sqs_worker::task_pool::{Executor, ExecutorRegistry, TaskPoolConfig, TaskPoolProcessor};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Invoice {
//!     order_id: u64,
//! }
//!
//! struct InvoiceRenderer;
//!
//! #[async_trait]
//! impl Executor for InvoiceRenderer {
//!     type Payload = Invoice;
//!
//!     async fn execute(&self, invoice: Invoice) -> Result<(), TaskError> {
//!         println!("rendering invoice for order {}", invoice.order_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), rs_sqs_worker::errors::SqsWorkerError> {
//! let mut registry = ExecutorRegistry::new();
//! registry.register("invoice:render", InvoiceRenderer)?;
//!
//! let processor = TaskPoolProcessor::new(TaskPoolConfig::default(), registry)?;
//! processor.start()?;
//!
//! let task = processor.new_task("order-42", "invoice:render", &Invoice { order_id: 42 })?;
//! processor.enqueue_task(task, None)?;
//!
//! processor.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::errors::{SqsWorkerError, TaskError, panic_message};
use crate::wait_group::WaitGroup;
use crate::worker_pool::WorkerPool;

mod executor;
mod task;

pub use executor::{DynExecutor, Executor, ExecutorRegistry, process_task};
pub use task::{Task, TaskInfo, TaskStatus};

const SHUTDOWN_ERROR: &str = "task pool shut down before the task ran";

/// Configuration for the task pool.
#[derive(Debug, Clone)]
pub struct TaskPoolConfig {
    /// Maximum number of tasks executing at the same time.
    pub concurrency_factor: usize,

    /// Retries given to tasks built with [`TaskPoolProcessor::new_task`].
    pub max_retry: u32,

    /// Per-attempt timeout given to tasks built with [`TaskPoolProcessor::new_task`].
    pub task_timeout: Duration,

    /// Delay before retry `n` is `retry_policy.retry_delay(n)`.
    pub retry_policy: BackoffPolicy,

    /// How long a completed or failed task stays visible to
    /// [`TaskPoolProcessor::task_info`].
    pub retention: Duration,

    /// Most completed or failed tasks kept at once; the oldest go first.
    pub max_retained: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        TaskPoolConfig {
            concurrency_factor: 10,
            max_retry: 3,
            task_timeout: Duration::from_secs(30),
            retry_policy: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            retention: Duration::from_secs(60 * 60),
            max_retained: 10_000,
        }
    }
}

impl TaskPoolConfig {
    pub fn validate(&self) -> Result<(), SqsWorkerError> {
        let invalid = |msg: &str| Err(SqsWorkerError::InvalidConfig(msg.to_string()));

        if self.concurrency_factor == 0 {
            return invalid("concurrency_factor must be at least 1");
        }
        if self.task_timeout.is_zero() {
            return invalid("task_timeout is not set");
        }
        if self.retry_policy.ceiling < self.retry_policy.base {
            return invalid("retry ceiling must not be below the retry base");
        }
        if self.retention.is_zero() {
            return invalid("retention is not set");
        }
        Ok(())
    }
}

/// Runs registered executors for enqueued tasks.
pub struct TaskPoolProcessor {
    inner: Arc<Inner>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: TaskPoolConfig,
    registry: ExecutorRegistry,
    pool: WorkerPool,
    tasks: Mutex<TaskTable>,
    ready_tx: mpsc::UnboundedSender<Task>,
    accepting: AtomicBool,
    stop_tx: watch::Sender<bool>,
    delayed: WaitGroup,
}

impl TaskPoolProcessor {
    pub fn new(config: TaskPoolConfig, registry: ExecutorRegistry) -> Result<Self, SqsWorkerError> {
        config.validate()?;
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        Ok(TaskPoolProcessor {
            inner: Arc::new(Inner {
                pool: WorkerPool::new(config.concurrency_factor),
                config,
                registry,
                tasks: Mutex::new(TaskTable::default()),
                ready_tx,
                accepting: AtomicBool::new(true),
                stop_tx,
                delayed: WaitGroup::new(),
            }),
            ready_rx: Mutex::new(Some(ready_rx)),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &TaskPoolConfig {
        &self.inner.config
    }

    /// Builds a task carrying the pool's default retry count and timeout.
    ///
    /// # Arguments
    ///
    /// * `id` - Task id; an empty id gets a random UUID
    /// * `task_type` - Selects the registered executor
    /// * `payload` - Encoded as JSON
    ///
    /// # Returns
    ///
    /// Returns the task, or `PayloadEncoding` if `payload` cannot be serialized.
    pub fn new_task<P: Serialize>(
        &self,
        id: impl Into<String>,
        task_type: impl Into<String>,
        payload: &P,
    ) -> Result<Task, SqsWorkerError> {
        let mut id = id.into();
        if id.is_empty() {
            id = Uuid::new_v4().to_string();
        }
        Ok(Task::new(
            id,
            task_type,
            serde_json::to_vec(payload)?,
            self.inner.config.max_retry,
            self.inner.config.task_timeout,
        ))
    }

    /// Hands `task` to the engine, optionally after `process_in`.
    ///
    /// Tasks enqueued before [`start`](TaskPoolProcessor::start) wait until it is
    /// called. An id is rejected while another task with the same id is still
    /// waiting or running.
    pub fn enqueue_task(
        &self,
        task: Task,
        process_in: Option<Duration>,
    ) -> Result<TaskInfo, SqsWorkerError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(SqsWorkerError::ShuttingDown);
        }

        let info = {
            let mut tasks = self.inner.lock_tasks();
            tasks.prune(&self.inner.config);
            if tasks.get(&task.id).is_some_and(|info| !info.status.is_terminal()) {
                return Err(SqsWorkerError::TaskIdConflict(task.id));
            }
            let info = TaskInfo::waiting(&task);
            tasks.insert(info.clone());
            info
        };

        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            delay_ms = process_in.map(|d| d.as_millis() as u64),
            "Enqueued task"
        );
        if let Err(e) = self.inner.schedule(task, process_in.unwrap_or(Duration::ZERO)) {
            self.inner.lock_tasks().remove(&info.id);
            return Err(e);
        }
        Ok(info)
    }

    /// Runs the executor registered for the task type once, inline.
    ///
    /// No timeout, retry or status tracking applies; the pool uses this for each
    /// attempt.
    pub async fn process_task(&self, task: &Task) -> Result<(), TaskError> {
        self.inner.process_task(task).await
    }

    /// Starts the workers and the dispatcher. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), SqsWorkerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SqsWorkerError::InitializationError(format!("no tokio runtime: {e}")))?;
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(SqsWorkerError::ShuttingDown);
        }

        let Some(ready_rx) = lock(&self.ready_rx).take() else {
            return Ok(());
        };
        self.inner.pool.start();
        let stop_rx = self.inner.stop_tx.subscribe();
        *lock(&self.dispatcher) = Some(runtime.spawn(dispatch(
            Arc::clone(&self.inner),
            ready_rx,
            stop_rx,
        )));

        info!(
            concurrency_factor = self.inner.config.concurrency_factor,
            task_types = ?self.inner.registry.registered_types(),
            "Task pool started"
        );
        Ok(())
    }

    /// Stops accepting tasks and waits for the running ones to finish.
    ///
    /// Tasks that are delayed, waiting for a retry, or not yet handed to a worker
    /// are marked failed.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.stop_tx.send_replace(true);
        self.inner.delayed.wait().await;

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!(error = %e, "Task dispatcher ended abnormally");
            }
        }
        let never_started = lock(&self.ready_rx).take();
        if let Some(mut ready_rx) = never_started {
            self.inner.abandon_ready(&mut ready_rx);
        }

        self.inner.pool.shutdown().await;
        // Retries scheduled by the last running attempts.
        self.inner.delayed.wait().await;
        info!("Task pool shut down");
    }

    /// Status of a task that is waiting, running, or finished within the
    /// retention window.
    pub fn task_info(&self, id: &str) -> Option<TaskInfo> {
        let mut tasks = self.inner.lock_tasks();
        tasks.prune(&self.inner.config);
        tasks.get(id).cloned()
    }
}

impl Inner {
    async fn process_task(&self, task: &Task) -> Result<(), TaskError> {
        let executor = self
            .registry
            .get(&task.task_type)
            .ok_or_else(|| TaskError::NoExecutor(task.task_type.clone()))?;
        executor.execute_task(task).await
    }

    /// Sends `task` to the dispatcher now, or after `delay` unless the pool
    /// shuts down first.
    fn schedule(self: &Arc<Self>, task: Task, delay: Duration) -> Result<(), SqsWorkerError> {
        if delay.is_zero() {
            return self.ready_tx.send(task).map_err(|_| SqsWorkerError::ShuttingDown);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SqsWorkerError::InitializationError(format!("no tokio runtime: {e}")))?;
        let guard = self.delayed.add();
        let inner = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        runtime.spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(mpsc::error::SendError(task)) = inner.ready_tx.send(task) {
                        inner.finish(&task.id, TaskStatus::Failed, Some(SHUTDOWN_ERROR.to_string()));
                    }
                }
                _ = stop_signalled(&mut stop_rx) => {
                    inner.finish(&task.id, TaskStatus::Failed, Some(SHUTDOWN_ERROR.to_string()));
                }
            }
        });
        Ok(())
    }

    /// One attempt of `task` on a worker.
    async fn run(self: Arc<Self>, task: Task) {
        self.update(&task.id, |info| info.status = TaskStatus::Running);
        let limit = if task.timeout.is_zero() {
            self.config.task_timeout
        } else {
            task.timeout
        };

        let attempt = AssertUnwindSafe(self.process_task(&task)).catch_unwind();
        let result = match tokio::time::timeout(limit, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(TaskError::Panicked(panic_message(panic.as_ref()).to_string())),
            Err(_) => Err(TaskError::Timeout(limit)),
        };

        let err = match result {
            Ok(()) => {
                self.finish(&task.id, TaskStatus::Completed, None);
                debug!(task_id = %task.id, task_type = %task.task_type, "Task completed");
                return;
            }
            Err(err) => err,
        };

        let retried = self.task_retried(&task.id);
        let accepting = self.accepting.load(Ordering::SeqCst);
        if !err.is_retryable() || retried >= task.max_retry || !accepting {
            error!(
                task_id = %task.id,
                task_type = %task.task_type,
                retried,
                error = %err,
                "Task failed"
            );
            self.finish(&task.id, TaskStatus::Failed, Some(err.to_string()));
            return;
        }

        let delay = self.config.retry_policy.retry_delay(retried);
        warn!(
            task_id = %task.id,
            task_type = %task.task_type,
            retry = retried + 1,
            max_retry = task.max_retry,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Task attempt failed, retrying"
        );
        self.update(&task.id, |info| {
            info.status = TaskStatus::Waiting;
            info.retried += 1;
            info.last_error = Some(err.to_string());
        });

        let id = task.id.clone();
        if let Err(e) = self.schedule(task, delay) {
            self.finish(&id, TaskStatus::Failed, Some(e.to_string()));
        }
    }

    fn abandon_ready(&self, ready_rx: &mut mpsc::UnboundedReceiver<Task>) {
        while let Ok(task) = ready_rx.try_recv() {
            self.finish(&task.id, TaskStatus::Failed, Some(SHUTDOWN_ERROR.to_string()));
        }
    }

    fn task_retried(&self, id: &str) -> u32 {
        self.lock_tasks().get(id).map_or(0, |info| info.retried)
    }

    fn finish(&self, id: &str, status: TaskStatus, last_error: Option<String>) {
        let mut tasks = self.lock_tasks();
        tasks.finish(id, status, last_error);
        tasks.prune(&self.config);
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut TaskInfo)) {
        if let Some(info) = self.lock_tasks().get_mut(id) {
            apply(info);
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, TaskTable> {
        lock(&self.tasks)
    }
}

/// Task statuses by id, plus the order in which tasks finished.
#[derive(Default)]
struct TaskTable {
    entries: HashMap<String, Entry>,
    /// May hold stale pairs for ids that were re-enqueued or finished again.
    finished: VecDeque<(Instant, String)>,
    /// Entries whose `finished_at` is set.
    retained: usize,
}

struct Entry {
    info: TaskInfo,
    finished_at: Option<Instant>,
}

impl TaskTable {
    fn get(&self, id: &str) -> Option<&TaskInfo> {
        self.entries.get(id).map(|entry| &entry.info)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut TaskInfo> {
        self.entries.get_mut(id).map(|entry| &mut entry.info)
    }

    fn insert(&mut self, info: TaskInfo) {
        let entry = Entry {
            info,
            finished_at: None,
        };
        if let Some(old) = self.entries.insert(entry.info.id.clone(), entry) {
            self.forget(&old);
        }
    }

    fn remove(&mut self, id: &str) {
        if let Some(old) = self.entries.remove(id) {
            self.forget(&old);
        }
    }

    fn finish(&mut self, id: &str, status: TaskStatus, last_error: Option<String>) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.info.status = status;
        if last_error.is_some() {
            entry.info.last_error = last_error;
        }
        if entry.finished_at.is_none() {
            self.retained += 1;
        }
        let now = Instant::now();
        entry.finished_at = Some(now);
        self.finished.push_back((now, id.to_string()));
    }

    /// Drops finished tasks older than `retention`, then the oldest ones
    /// beyond `max_retained`. Waiting and running tasks are never dropped.
    fn prune(&mut self, config: &TaskPoolConfig) {
        let now = Instant::now();
        while let Some((finished_at, _)) = self.finished.front() {
            let expired = now.saturating_duration_since(*finished_at) >= config.retention;
            if !expired && self.retained <= config.max_retained {
                break;
            }
            let Some((finished_at, id)) = self.finished.pop_front() else {
                break;
            };
            if self
                .entries
                .get(&id)
                .is_some_and(|entry| entry.finished_at == Some(finished_at))
            {
                self.entries.remove(&id);
                self.retained -= 1;
            }
        }
    }

    fn forget(&mut self, old: &Entry) {
        if old.finished_at.is_some() {
            self.retained -= 1;
        }
    }
}

/// Moves ready tasks onto the worker pool until the pool shuts down.
async fn dispatch(
    inner: Arc<Inner>,
    mut ready_rx: mpsc::UnboundedReceiver<Task>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = stop_signalled(&mut stop_rx) => break,
            task = ready_rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let id = task.id.clone();
        let job = Arc::clone(&inner).run(task);
        // Waits while every worker slot is taken.
        if let Err(e) = inner.pool.execute_task(job).await {
            inner.finish(&id, TaskStatus::Failed, Some(e.to_string()));
        }
    }

    inner.abandon_ready(&mut ready_rx);
    debug!("Task dispatcher exited");
}

/// Resolves once the stop flag is set or its sender is gone.
async fn stop_signalled(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *stop_rx.borrow_and_update();
        if stopped || stop_rx.changed().await.is_err() {
            return;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
