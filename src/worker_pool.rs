//! Fixed-size pool of async workers.
//!
//! ```rust,no_run
//! use rs_sqs_worker::worker_pool::WorkerPool;
//!
//! # async fn run() -> Result<(), rs_sqs_worker::errors::SqsWorkerError> {
//! let pool = WorkerPool::new(10);
//! pool.start();
//! pool.execute_task(async { println!("running on a worker") }).await?;
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::errors::{SqsWorkerError, panic_message};

type Job = (BoxFuture<'static, ()>, OwnedSemaphorePermit);

/// A bounded set of worker slots.
///
/// Every submitted job holds one slot from submission until it finishes, so at
/// most `max_workers` jobs are queued or running at any time and
/// [`execute_task`](WorkerPool::execute_task) waits while all slots are taken.
pub struct WorkerPool {
    max_workers: usize,
    slots: Arc<Semaphore>,
    job_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    job_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool with `max_workers` slots. Zero is clamped to one.
    pub fn new(max_workers: usize) -> Self {
        let max_workers = if max_workers == 0 {
            warn!("Worker pool created with 0 workers; clamping to 1");
            1
        } else {
            max_workers
        };
        let (job_tx, job_rx) = mpsc::unbounded_channel();

        WorkerPool {
            max_workers,
            slots: Arc::new(Semaphore::new(max_workers)),
            job_tx: Mutex::new(Some(job_tx)),
            job_rx: Arc::new(tokio::sync::Mutex::new(job_rx)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Slots not currently held by a queued or running job.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Spawns one worker per slot. Calling it again is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.max_workers {
            let job_rx = Arc::clone(&self.job_rx);
            workers.push(tokio::spawn(worker_loop(worker_id, job_rx)));
        }
        debug!(workers = self.max_workers, "Worker pool started");
    }

    /// Hands `task` to the pool, waiting until a slot is free.
    ///
    /// Jobs are expected to deal with their own errors. A panicking job is logged
    /// and does not take its worker down.
    pub async fn execute_task<F>(&self, task: F) -> Result<(), SqsWorkerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| SqsWorkerError::PoolClosed)?;

        let sender = lock(&self.job_tx).clone().ok_or(SqsWorkerError::PoolClosed)?;
        sender
            .send((task.boxed(), permit))
            .map_err(|_| SqsWorkerError::PoolClosed)
    }

    /// Stops accepting jobs, lets workers finish everything already submitted
    /// and waits for them to exit.
    pub async fn shutdown(&self) {
        self.slots.close();
        lock(&self.job_tx).take();

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        debug!("Worker pool shut down");
    }
}

async fn worker_loop(worker_id: usize, job_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        let next = job_rx.lock().await.recv().await;
        let Some((job, permit)) = next else {
            break;
        };

        if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
            error!(worker_id, panic = %panic_message(panic.as_ref()), "Worker pool job panicked");
        }
        drop(permit);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
