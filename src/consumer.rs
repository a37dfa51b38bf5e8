//! Bounded-concurrency queue consumer.
//!
//! A single poll loop receives batches from the source queue and runs the
//! handler for each message on its own task, never more than
//! `concurrency_factor` at a time. A handler returning `Ok` deletes the message;
//! an error copies its body to the dead-letter queue and leaves the delivery to
//! the broker. [`ConsumerClient::stop`] only returns once every dispatched
//! handler has finished.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rs_sqs_worker::consumer::{ConsumerClient, ConsumerConfig, handler_fn};
//! use rs_sqs_worker::transport::SqsTransport;
//!
//! # async fn run() -> Result<(), rs_sqs_worker::errors::SqsWorkerError> {
//! let transport = Arc::new(SqsTransport::from_env().await);
//! let config = ConsumerConfig {
//!     queue_url: "https://sqs.us-east-1.amazonaws.com/123/orders".into(),
//!     dlq_url: Some("https://sqs.us-east-1.amazonaws.com/123/orders-dlq".into()),
//!     concurrency_factor: 8,
//!     ..Default::default()
//! };
//! let consumer = ConsumerClient::new(
//!     transport,
//!     handler_fn(|message| async move {
//!         println!("processing {}", message.body);
//!         Ok(())
//!     }),
//!     config,
//! )?;
//!
//! consumer.start()?;
//! tokio::signal::ctrl_c().await.ok();
//! consumer.stop().await;
//! # Ok(())
//! # }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::AdaptiveBackoff;
use crate::errors::{SqsWorkerError, panic_message};
use crate::transport::{Message, MessageTransport, SendRequest, with_timeout};
use crate::wait_group::WaitGroup;

mod config;
mod handler;
mod reporting;

pub use config::{ConsumerConfig, FailedMessagePolicy};
pub use handler::{MessageHandler, MessageHandlerFn, handler_fn};
pub use reporting::ConsumerStatsSnapshot;

use reporting::{ConsumerStats, Counter, report_error_event, report_processed_message};

/// Result of [`ConsumerClient::stop_with_grace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight handler finished.
    Drained,
    /// The grace period ran out; these handlers are still running, detached.
    Abandoned { in_flight: usize },
}

/// Polls one queue and dispatches messages to a [`MessageHandler`].
pub struct ConsumerClient<T, H>
where
    T: MessageTransport + 'static,
    H: MessageHandler + 'static,
{
    shared: Arc<Shared<T, H>>,
    stop_tx: watch::Sender<bool>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared<T, H> {
    transport: Arc<T>,
    handler: H,
    config: ConsumerConfig,
    /// One token per running handler, shared by every poll loop of the client.
    worker_tokens: Arc<Semaphore>,
    /// Held by the poll loop until it has exited.
    poll_loops: WaitGroup,
    in_flight: WaitGroup,
    stats: ConsumerStats,
}

impl<T, H> ConsumerClient<T, H>
where
    T: MessageTransport + 'static,
    H: MessageHandler + 'static,
{
    /// Validates `config` and builds a stopped consumer.
    ///
    /// # Arguments
    ///
    /// * `transport` - Broker used for receive, delete and dead-letter sends
    /// * `handler` - Called once per received message
    /// * `config` - Queue URLs, concurrency factor and polling settings
    ///
    /// # Returns
    ///
    /// Returns the consumer, not yet polling, or `InvalidConfig` when `config`
    /// fails validation.
    pub fn new(transport: Arc<T>, handler: H, config: ConsumerConfig) -> Result<Self, SqsWorkerError> {
        config.validate()?;
        let (stop_tx, _) = watch::channel(false);

        Ok(ConsumerClient {
            shared: Arc::new(Shared {
                transport,
                handler,
                worker_tokens: Arc::new(Semaphore::new(config.concurrency_factor)),
                config,
                poll_loops: WaitGroup::new(),
                in_flight: WaitGroup::new(),
                stats: ConsumerStats::default(),
            }),
            stop_tx,
            poll_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.config
    }

    /// Spawns the poll loop and returns immediately.
    ///
    /// Fails with [`SqsWorkerError::AlreadyStarted`] while a previous loop is
    /// still polling, and with an initialization error outside a tokio runtime.
    pub fn start(&self) -> Result<(), SqsWorkerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SqsWorkerError::InitializationError(format!("no tokio runtime: {e}")))?;

        let mut poll_task = lock(&self.poll_task);
        if self.shared.poll_loops.count() > 0 {
            return Err(SqsWorkerError::AlreadyStarted);
        }

        self.stop_tx.send_replace(false);
        let stop_rx = self.stop_tx.subscribe();
        let running = self.shared.poll_loops.add();
        let shared = Arc::clone(&self.shared);
        *poll_task = Some(runtime.spawn(async move {
            let _running = running;
            poll(shared, stop_rx).await;
        }));

        let config = &self.shared.config;
        info!(
            queue_url = %config.queue_url,
            dlq_url = config.dlq_url.as_deref().unwrap_or("none"),
            concurrency_factor = config.concurrency_factor,
            max_polls = ?config.max_polls,
            "Starting SQS consumer"
        );
        Ok(())
    }

    /// True until the poll loop has exited, including after an abandoned
    /// [`stop_with_grace`](ConsumerClient::stop_with_grace).
    pub fn is_running(&self) -> bool {
        self.shared.poll_loops.count() > 0
    }

    /// Number of handlers dispatched and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.count()
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stops polling and waits until every dispatched handler has finished.
    ///
    /// Handlers are never cancelled, so a hung handler keeps this waiting; see
    /// [`stop_with_grace`](ConsumerClient::stop_with_grace) for a bounded wait.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);

        // The handle stays in place until the loop is gone, so a cancelled stop
        // cannot let `start` spawn a second loop.
        self.shared.poll_loops.wait().await;
        let poll_task = lock(&self.poll_task).take();
        if let Some(handle) = poll_task {
            if let Err(e) = handle.await {
                error!(queue_url = %self.shared.config.queue_url, error = %e, "Poll loop ended abnormally");
            }
        }

        if self.in_flight() > 0 {
            info!(
                queue_url = %self.shared.config.queue_url,
                in_flight = self.in_flight(),
                "Draining in-flight messages"
            );
        }
        self.shared.in_flight.wait().await;
        info!(queue_url = %self.shared.config.queue_url, "SQS consumer stopped");
    }

    /// Like [`stop`](ConsumerClient::stop) but gives up after `grace`.
    ///
    /// Handlers still running at that point keep running detached from the
    /// consumer; their outcome (delete or DLQ) is still applied.
    pub async fn stop_with_grace(&self, grace: Duration) -> DrainOutcome {
        match tokio::time::timeout(grace, self.stop()).await {
            Ok(()) => DrainOutcome::Drained,
            Err(_) => {
                let in_flight = self.in_flight();
                warn!(
                    queue_url = %self.shared.config.queue_url,
                    in_flight,
                    grace_ms = grace.as_millis() as u64,
                    "Drain grace period elapsed, abandoning in-flight handlers"
                );
                DrainOutcome::Abandoned { in_flight }
            }
        }
    }
}

impl<T, H> Drop for ConsumerClient<T, H>
where
    T: MessageTransport + 'static,
    H: MessageHandler + 'static,
{
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

/// The poll loop. Owns the backoff state.
async fn poll<T, H>(shared: Arc<Shared<T, H>>, mut stop_rx: watch::Receiver<bool>)
where
    T: MessageTransport + 'static,
    H: MessageHandler + 'static,
{
    let config = &shared.config;
    let mut backoff = AdaptiveBackoff::new(config.backoff_policy());
    let receive_options = config.receive_options();
    let mut poll_count: u64 = 0;

    'poll: loop {
        if stop_requested(&stop_rx) {
            info!(queue_url = %config.queue_url, "Stop signal received, stopping poll loop");
            break;
        }
        if config.max_polls.is_some_and(|max| poll_count >= max) {
            info!(queue_url = %config.queue_url, poll_count, "Reached max polls, stopping poll loop");
            break;
        }
        poll_count += 1;

        let received = tokio::select! {
            _ = stop_rx.changed() => {
                info!(queue_url = %config.queue_url, "Stop signal received during receive, stopping poll loop");
                break;
            }
            result = with_timeout(
                config.receive_timeout,
                shared.transport.receive(&config.queue_url, &receive_options),
            ) => result,
        };

        let messages = match received {
            Ok(messages) => {
                backoff.reset();
                messages
            }
            Err(err) => {
                shared.stats.incr(Counter::ReceiveError);
                let delay = backoff.next_delay(&err);
                report_error_event(&config.queue_url, "receive_message", &err);
                warn!(
                    queue_url = %config.queue_url,
                    throttled = err.is_throttling(),
                    backoff_ms = delay.as_millis() as u64,
                    "Backing off after receive error"
                );
                if sleep_or_stop(delay, &mut stop_rx).await {
                    break;
                }
                continue;
            }
        };

        if messages.is_empty() {
            if sleep_or_stop(config.poll_interval, &mut stop_rx).await {
                break;
            }
            continue;
        }

        debug!(queue_url = %config.queue_url, message_count = messages.len(), "Received messages");

        for message in messages {
            let in_flight = shared.in_flight.add();
            // Blocks while every token is held by a running handler.
            let acquired = tokio::select! {
                biased;
                permit = Arc::clone(&shared.worker_tokens).acquire_owned() => permit,
                _ = stop_signalled(&mut stop_rx) => {
                    info!(
                        queue_url = %config.queue_url,
                        "Stop signal received while waiting for a worker, leaving remaining messages for redelivery"
                    );
                    break 'poll;
                }
            };
            let permit = match acquired {
                Ok(permit) => permit,
                Err(err) => {
                    error!(queue_url = %config.queue_url, error = %err, "Worker tokens closed, stopping poll loop");
                    return;
                }
            };
            shared.stats.incr(Counter::Received);

            let task_shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let _permit = permit;
                let _in_flight = in_flight;
                task_shared.process(message).await;
            });
        }
    }

    debug!(queue_url = %config.queue_url, poll_count, "Poll loop exited");
}

impl<T, H> Shared<T, H>
where
    T: MessageTransport,
    H: MessageHandler,
{
    /// Runs the handler for one message and applies the outcome.
    async fn process(&self, message: Message) {
        let queue_url = &self.config.queue_url;
        let timeout = self.config.message_process_timeout;

        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(self.handler.handle(message.clone())).catch_unwind(),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(err))) => Some(err.to_string()),
            Ok(Err(panic)) => Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
            Err(_) => Some(format!("handler timed out after {timeout:?}")),
        };

        match failure {
            None => {
                self.stats.incr(Counter::Succeeded);
                let deleted = with_timeout(
                    self.config.receive_timeout,
                    self.transport.delete(queue_url, &message.receipt_handle),
                )
                .await;
                match deleted {
                    Ok(()) => {
                        self.stats.incr(Counter::Deleted);
                        report_processed_message(queue_url, &message.id);
                    }
                    Err(err) => {
                        self.stats.incr(Counter::DeleteFailure);
                        report_error_event(queue_url, "delete_message", &err);
                    }
                }
            }
            Some(reason) => {
                self.stats.incr(Counter::Failed);
                self.move_to_dead_letter_queue(&message).await;
                report_error_event(queue_url, "process_message", &reason);
            }
        }
    }

    /// Copies the body of a failed message to the DLQ, best effort.
    async fn move_to_dead_letter_queue(&self, message: &Message) {
        let queue_url = &self.config.queue_url;
        let Some(dlq_url) = &self.config.dlq_url else {
            warn!(
                queue_url = %queue_url,
                message_id = %message.id,
                "No dead-letter queue configured, message left for redelivery"
            );
            return;
        };

        let request = SendRequest::new(dlq_url.clone(), message.body.clone());
        if let Err(err) = with_timeout(self.config.receive_timeout, self.transport.send(&request)).await {
            self.stats.incr(Counter::DeadLetterFailure);
            report_error_event(queue_url, "move_to_dlq", &err);
            return;
        }
        self.stats.incr(Counter::DeadLettered);
        info!(queue_url = %queue_url, dlq_url = %dlq_url, message_id = %message.id, "Moved message to DLQ");

        if let FailedMessagePolicy::ExtendVisibility(extension) = self.config.failed_message_policy {
            let extended = with_timeout(
                self.config.receive_timeout,
                self.transport
                    .change_visibility(queue_url, &message.receipt_handle, extension),
            )
            .await;
            if let Err(err) = extended {
                report_error_event(queue_url, "change_message_visibility", &err);
            }
        }
    }
}

/// Sleeps for `duration`; returns true if a stop was requested meanwhile.
async fn sleep_or_stop(duration: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop_rx.changed() => true,
    }
}

/// Resolves once a stop was requested or the client is gone.
async fn stop_signalled(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *stop_rx.borrow_and_update();
        if stopped || stop_rx.changed().await.is_err() {
            return;
        }
    }
}

fn stop_requested(stop_rx: &watch::Receiver<bool>) -> bool {
    *stop_rx.borrow() || stop_rx.has_changed().is_err()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
