use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Message, MessageTransport, ReceiveOptions, SendRequest, TransportError};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// In-process broker implementing [`MessageTransport`].
///
/// Queues are created on first use. A received message stays hidden for the
/// visibility timeout and is handed out again afterwards with a fresh receipt
/// handle, like SQS. Receives return immediately; there is no long polling.
///
/// ```rust
/// use rs_sqs_worker::transport::InMemoryQueue;
///
/// let queue = InMemoryQueue::new();
/// queue.push("orders", "{\"id\":1}");
/// assert_eq!(queue.len("orders"), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    broker: Arc<Mutex<Broker>>,
}

#[derive(Debug, Default)]
struct Broker {
    queues: HashMap<String, Vec<StoredMessage>>,
    receive_errors: VecDeque<TransportError>,
    visibility_timeout: Option<Duration>,
    receive_calls: u64,
}

#[derive(Debug)]
struct StoredMessage {
    id: String,
    body: String,
    attributes: HashMap<String, String>,
    receipt_handle: Option<String>,
    invisible_until: Option<Instant>,
    receive_count: u32,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the visibility timeout applied on receive (30s by default).
    pub fn with_visibility_timeout(self, timeout: Duration) -> Self {
        self.lock().visibility_timeout = Some(timeout);
        self
    }

    /// Enqueues `body` on `queue_url` and returns the new message id.
    pub fn push(&self, queue_url: &str, body: impl Into<String>) -> String {
        self.lock().store(queue_url, body.into(), HashMap::new())
    }

    /// Makes the next receive call fail with `error`. Errors queue up in order.
    pub fn fail_next_receive(&self, error: TransportError) {
        self.lock().receive_errors.push_back(error);
    }

    /// Number of messages stored on the queue, in flight or not.
    pub fn len(&self, queue_url: &str) -> usize {
        self.lock().queues.get(queue_url).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, queue_url: &str) -> bool {
        self.len(queue_url) == 0
    }

    /// Number of messages a receive call could return right now.
    pub fn visible_len(&self, queue_url: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .queues
            .get(queue_url)
            .map_or(0, |messages| messages.iter().filter(|m| m.is_visible(now)).count())
    }

    /// Bodies of every stored message in send order.
    pub fn bodies(&self, queue_url: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue_url)
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, queue_url: &str, message_id: &str) -> bool {
        self.lock()
            .queues
            .get(queue_url)
            .is_some_and(|messages| messages.iter().any(|m| m.id == message_id))
    }

    /// Total receive calls served, including failed ones.
    pub fn receive_calls(&self) -> u64 {
        self.lock().receive_calls
    }

    fn lock(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Broker {
    fn store(&mut self, queue_url: &str, body: String, attributes: HashMap<String, String>) -> String {
        let id = Uuid::new_v4().to_string();
        self.queues
            .entry(queue_url.to_string())
            .or_default()
            .push(StoredMessage {
                id: id.clone(),
                body,
                attributes,
                receipt_handle: None,
                invisible_until: None,
                receive_count: 0,
            });
        id
    }

    fn find_delivery(&mut self, queue_url: &str, receipt_handle: &str) -> Option<(usize, &mut Vec<StoredMessage>)> {
        let messages = self.queues.get_mut(queue_url)?;
        let index = messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))?;
        Some((index, messages))
    }
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

fn invalid_receipt(operation: &'static str, receipt_handle: &str) -> TransportError {
    TransportError::Service {
        operation,
        code: Some("ReceiptHandleIsInvalid".to_string()),
        message: format!("unknown receipt handle {receipt_handle}"),
    }
}

#[async_trait]
impl MessageTransport for InMemoryQueue {
    async fn receive(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, TransportError> {
        let mut broker = self.lock();
        broker.receive_calls += 1;
        if let Some(error) = broker.receive_errors.pop_front() {
            return Err(error);
        }

        let now = Instant::now();
        let visibility = broker.visibility_timeout.unwrap_or(DEFAULT_VISIBILITY_TIMEOUT);
        let limit = usize::try_from(options.max_number_of_messages.max(1)).unwrap_or(1);
        let Some(messages) = broker.queues.get_mut(queue_url) else {
            return Ok(Vec::new());
        };

        let mut received = Vec::new();
        for stored in messages.iter_mut().filter(|m| m.is_visible(now)).take(limit) {
            let receipt_handle = Uuid::new_v4().to_string();
            stored.receipt_handle = Some(receipt_handle.clone());
            stored.invisible_until = Some(now + visibility);
            stored.receive_count += 1;

            let mut attributes = stored.attributes.clone();
            attributes.insert(
                "ApproximateReceiveCount".to_string(),
                stored.receive_count.to_string(),
            );
            received.push(Message {
                id: stored.id.clone(),
                receipt_handle,
                body: stored.body.clone(),
                attributes,
            });
        }

        Ok(received)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError> {
        let mut broker = self.lock();
        let (index, messages) = broker
            .find_delivery(queue_url, receipt_handle)
            .ok_or_else(|| invalid_receipt("delete_message", receipt_handle))?;
        messages.remove(index);
        Ok(())
    }

    async fn send(&self, request: &SendRequest) -> Result<String, TransportError> {
        let attributes = request
            .attributes
            .iter()
            .map(|a| (a.key.clone(), a.value.clone()))
            .collect();
        Ok(self
            .lock()
            .store(&request.queue_url, request.body.clone(), attributes))
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut broker = self.lock();
        let (index, messages) = broker
            .find_delivery(queue_url, receipt_handle)
            .ok_or_else(|| invalid_receipt("change_message_visibility", receipt_handle))?;
        messages[index].invisible_until = Some(Instant::now() + visibility_timeout);
        Ok(())
    }
}
