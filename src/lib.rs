//! # RS SQS Worker
//!
//! Bounded-concurrency message queue workers on top of AWS SQS: a consumer that
//! polls a queue and runs an async handler per message, a producer with retries,
//! a fixed-size worker pool, and an in-process task pool with typed executors.
//!
//! ## Features
//!
//! - Asynchronous SQS polling with tokio and long polling
//! - At most `concurrency_factor` handlers in flight; the poll loop waits for a
//!   free slot instead of over-fetching
//! - Successful messages are deleted, failed ones are copied to a dead-letter queue
//! - Adaptive backoff on receive errors, doubling while the broker throttles
//! - Graceful stop that drains every in-flight handler
//! - Producer with exponential retries and batch sends
//! - Task pool with JSON payloads, per-type executors, retries and timeouts
//! - `InMemoryQueue` transport for tests without AWS
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rs_sqs_worker::{ConsumerClient, ConsumerConfig, SqsTransport, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(SqsTransport::from_env().await);
//!     let config = ConsumerConfig {
//!         queue_url: "https://sqs.region.amazonaws.com/account/queue-name".into(),
//!         dlq_url: Some("https://sqs.region.amazonaws.com/account/queue-name-dlq".into()),
//!         ..Default::default()
//!     };
//!
//!     let consumer = ConsumerClient::new(
//!         transport,
//!         handler_fn(|message| async move {
//!             println!("Processing message: {}", message.body);
//!             Ok(())
//!         }),
//!         config,
//!     )?;
//!
//!     consumer.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     consumer.stop().await;
//!
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod consumer;
pub mod errors;
pub mod producer;
pub mod task_pool;
pub mod transport;
mod wait_group;
pub mod worker_pool;

pub use backoff::{AdaptiveBackoff, BackoffPolicy};
pub use consumer::{
    ConsumerClient, ConsumerConfig, ConsumerStatsSnapshot, DrainOutcome, FailedMessagePolicy,
    MessageHandler, handler_fn,
};
pub use errors::{GenericError, SqsWorkerError, TaskError};
pub use producer::{Producer, ProducerConfig};
pub use task_pool::{Executor, ExecutorRegistry, Task, TaskInfo, TaskPoolConfig, TaskPoolProcessor, TaskStatus};
pub use transport::{InMemoryQueue, Message, MessageTransport, SqsTransport};
pub use worker_pool::WorkerPool;
