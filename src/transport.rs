//! Queue transport boundary.
//!
//! The consumer and producer never talk to a broker directly; they go through
//! [`MessageTransport`]. [`SqsTransport`] is the AWS implementation and
//! [`InMemoryQueue`] a local broker for tests and development.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod sqs;

pub use memory::InMemoryQueue;
pub use sqs::SqsTransport;

/// Maximum number of entries SQS accepts in a single batch call.
pub const MAX_BATCH_ENTRIES: usize = 10;

/// A message received from a queue.
///
/// `receipt_handle` identifies this particular delivery and is what deletion and
/// visibility changes operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

/// A typed message attribute, e.g. `("tenant", "42", "Number")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    pub value: String,
    pub data_type: String,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            data_type: data_type.into(),
        }
    }

    /// Shorthand for a `String` typed attribute.
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, value, "String")
    }
}

/// A single send to `queue_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub queue_url: String,
    pub body: String,
    pub attributes: Vec<Attribute>,
}

impl SendRequest {
    pub fn new(queue_url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            body: body.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<Attribute>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// One entry of a batch send. `id` must be unique within the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub id: String,
    pub body: String,
    pub attributes: Vec<Attribute>,
}

impl BatchEntry {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            attributes: Vec::new(),
        }
    }
}

/// Entry the broker refused during a batch send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: String,
    pub code: String,
    pub message: Option<String>,
}

/// Result of a batch send call that reached the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSendOutput {
    pub successful: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

/// Parameters of a single receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Maximum number of messages returned by one call (1..=10 on SQS).
    pub max_number_of_messages: i32,
    /// Long polling wait time, in seconds.
    pub wait_time_seconds: i32,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        ReceiveOptions {
            max_number_of_messages: 10,
            wait_time_seconds: 20,
        }
    }
}

/// Classified transport failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The broker asked us to slow down (over limit / throttled).
    #[error("request throttled by queue service: {0}")]
    Throttled(String),

    #[error("queue does not exist: {0}")]
    QueueDoesNotExist(String),

    #[error("transport call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{operation} failed: {message}")]
    Service {
        operation: &'static str,
        code: Option<String>,
        message: String,
    },
}

impl TransportError {
    pub fn service(operation: &'static str, message: impl Into<String>) -> Self {
        TransportError::Service {
            operation,
            code: None,
            message: message.into(),
        }
    }

    /// True when the error is a rate limit / over-capacity signal.
    pub fn is_throttling(&self) -> bool {
        matches!(self, TransportError::Throttled(_))
    }
}

/// Runs a transport call, turning an expired `limit` into [`TransportError::Timeout`].
pub(crate) async fn with_timeout<F, O>(limit: Duration, call: F) -> Result<O, TransportError>
where
    F: Future<Output = Result<O, TransportError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(TransportError::Timeout(limit)))
}

/// Operations the consumer and producer need from a queue broker.
///
/// Implementations must be safe to share between tasks. Futures are dropped on
/// timeout, so every call must be cancellable at any await point.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn receive(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, TransportError>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError>;

    /// Sends one message and returns the broker-assigned message id.
    async fn send(&self, request: &SendRequest) -> Result<String, TransportError>;

    /// Sends up to [`MAX_BATCH_ENTRIES`] messages in one call.
    ///
    /// The default implementation sends entries one by one and stops at the
    /// first transport error.
    async fn send_batch(
        &self,
        queue_url: &str,
        entries: &[BatchEntry],
    ) -> Result<BatchSendOutput, TransportError> {
        let mut output = BatchSendOutput::default();
        for entry in entries {
            let request = SendRequest {
                queue_url: queue_url.to_string(),
                body: entry.body.clone(),
                attributes: entry.attributes.clone(),
            };
            self.send(&request).await?;
            output.successful.push(entry.id.clone());
        }
        Ok(output)
    }

    /// Changes how long the delivery identified by `receipt_handle` stays hidden.
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> Result<(), TransportError>;
}
