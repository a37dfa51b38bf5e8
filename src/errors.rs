use std::any::Any;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Error types for SQS worker operations.
///
/// Covers construction, transport and lifecycle failures of the consumer,
/// producer, worker pool and task pool.
#[derive(Debug, Error)]
pub enum SqsWorkerError {
    /// Error that occurs during AWS SQS client initialization.
    ///
    /// This error typically happens when there are issues with AWS credentials,
    /// region configuration, or when no async runtime is available.
    #[error("failed to initialize AWS SQS client: {0}")]
    InitializationError(String),

    /// A configuration value is missing or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A batch send was rejected before reaching the queue.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("consumer is already running")]
    AlreadyStarted,

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("task processor is shutting down")]
    ShuttingDown,

    #[error("task id conflicts with an active task: {0}")]
    TaskIdConflict(String),

    #[error("executor already registered for task type {0}")]
    DuplicateExecutor(String),

    #[error("failed to encode task payload: {0}")]
    PayloadEncoding(#[from] serde_json::Error),

    #[error("{0}")]
    GenericError(#[from] GenericError),
}

/// Generic error type for handling unexpected errors.
///
/// Message handlers usually return this through `SqsWorkerError::GenericError`.
#[derive(Debug, Error)]
pub struct GenericError(String);

impl GenericError {
    /// Creates a new `GenericError` with the provided message.
    pub fn new(message: impl Into<String>) -> Self {
        GenericError(message.into())
    }
}

impl std::fmt::Display for GenericError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenericError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(GenericError::new(s))
    }
}

impl From<String> for GenericError {
    fn from(s: String) -> Self {
        GenericError::new(s)
    }
}

impl From<&str> for GenericError {
    fn from(s: &str) -> Self {
        GenericError::new(s)
    }
}

/// Outcome of a failed task execution inside the task pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The task must not be retried, e.g. its payload cannot be decoded.
    #[error("skip retry: {0}")]
    SkipRetry(String),

    /// A business failure; retried up to the task's max retry count.
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("no executor registered for task type {0}")]
    NoExecutor(String),
}

impl TaskError {
    /// Creates a retryable business failure.
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::Failed(_) | TaskError::Timeout(_) | TaskError::Panicked(_)
        )
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}
