//! Retrying message producer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::backoff::BackoffPolicy;
use crate::errors::SqsWorkerError;
use crate::transport::{
    Attribute, BatchEntry, MAX_BATCH_ENTRIES, MessageTransport, SendRequest, TransportError,
    with_timeout,
};

/// Configuration for a [`Producer`].
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Queue every send targets.
    pub queue_url: String,
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    /// Delay between attempts: `base * 2^attempt`, capped at the ceiling.
    pub retry_policy: BackoffPolicy,
    /// Limit for a single send call; an expired call counts as a failed attempt.
    pub send_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            queue_url: String::new(),
            max_attempts: 3,
            retry_policy: BackoffPolicy::PRODUCER,
            send_timeout: Duration::from_secs(30),
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<(), SqsWorkerError> {
        if self.queue_url.trim().is_empty() {
            return Err(SqsWorkerError::InvalidConfig("producer queue_url is not set".into()));
        }
        if self.max_attempts == 0 {
            return Err(SqsWorkerError::InvalidConfig(
                "producer max_attempts must be at least 1".into(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(SqsWorkerError::InvalidConfig("producer send_timeout is not set".into()));
        }
        Ok(())
    }
}

/// Sends messages to one queue, retrying transport failures.
///
/// The retry delay is computed per call and never shared between calls.
pub struct Producer<T>
where
    T: MessageTransport,
{
    transport: Arc<T>,
    config: ProducerConfig,
}

impl<T> Producer<T>
where
    T: MessageTransport,
{
    /// Creates a producer for `config.queue_url`.
    ///
    /// # Arguments
    ///
    /// * `transport` - Broker the messages are sent through
    /// * `config` - Target queue, attempt count, retry delays and send timeout
    ///
    /// # Returns
    ///
    /// Returns the producer, or `InvalidConfig` if `config` fails validation.
    pub fn new(transport: Arc<T>, config: ProducerConfig) -> Result<Self, SqsWorkerError> {
        config.validate()?;
        Ok(Producer { transport, config })
    }

    pub fn queue_url(&self) -> &str {
        &self.config.queue_url
    }

    /// Sends one message and returns its broker-assigned id.
    ///
    /// After `max_attempts` failures the last transport error is returned.
    pub async fn send_message(
        &self,
        body: impl Into<String>,
        attributes: Vec<Attribute>,
    ) -> Result<String, SqsWorkerError> {
        let request = SendRequest {
            queue_url: self.config.queue_url.clone(),
            body: body.into(),
            attributes,
        };

        let mut attempt = 0;
        loop {
            match with_timeout(self.config.send_timeout, self.transport.send(&request)).await {
                Ok(message_id) => {
                    debug!(queue_url = %request.queue_url, message_id = %message_id, "Message sent");
                    return Ok(message_id);
                }
                Err(err) => {
                    if !self.retry_after(attempt, "send_message", &err).await {
                        return Err(err.into());
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Sends up to 10 entries in a single batch call.
    ///
    /// Entries the broker rejects individually are logged; the call itself
    /// succeeds as long as the batch request went through.
    pub async fn send_messages_batch(&self, entries: Vec<BatchEntry>) -> Result<(), SqsWorkerError> {
        if entries.is_empty() {
            return Err(SqsWorkerError::InvalidBatch("batch has no entries".into()));
        }
        if entries.len() > MAX_BATCH_ENTRIES {
            return Err(SqsWorkerError::InvalidBatch(format!(
                "batch has {} entries, at most {MAX_BATCH_ENTRIES} are allowed",
                entries.len()
            )));
        }

        let mut attempt = 0;
        loop {
            let batch = self.transport.send_batch(&self.config.queue_url, &entries);
            match with_timeout(self.config.send_timeout, batch).await {
                Ok(output) => {
                    for failure in &output.failed {
                        warn!(
                            queue_url = %self.config.queue_url,
                            id = %failure.id,
                            code = %failure.code,
                            message = failure.message.as_deref().unwrap_or("unknown"),
                            "Batch entry rejected by queue"
                        );
                    }
                    debug!(
                        queue_url = %self.config.queue_url,
                        sent = output.successful.len(),
                        rejected = output.failed.len(),
                        "Batch sent"
                    );
                    return Ok(());
                }
                Err(err) => {
                    if !self.retry_after(attempt, "send_message_batch", &err).await {
                        return Err(err.into());
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Logs `err` and sleeps before the next attempt. Returns false once the
    /// attempts are used up.
    async fn retry_after(&self, attempt: u32, operation: &'static str, err: &TransportError) -> bool {
        let attempts_left = self.config.max_attempts.saturating_sub(attempt + 1);
        match err {
            TransportError::Throttled(_) => warn!(
                queue_url = %self.config.queue_url,
                operation,
                error = %err,
                attempts_left,
                "Hit message limit on SQS"
            ),
            _ => error!(
                queue_url = %self.config.queue_url,
                operation,
                error = %err,
                attempts_left,
                "Encountered error with SQS"
            ),
        }

        if attempts_left == 0 {
            return false;
        }
        tokio::time::sleep(self.config.retry_policy.retry_delay(attempt)).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BatchSendOutput, Message, ReceiveOptions};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails the first `failures` sends, then succeeds. With `hang` set the
    /// failing sends never return instead.
    struct FlakyTransport {
        failures: u32,
        hang: bool,
        calls: AtomicU32,
        batches: Mutex<Vec<usize>>,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                hang: false,
                calls: AtomicU32::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn hanging(failures: u32) -> Self {
            Self {
                hang: true,
                ..Self::new(failures)
            }
        }

        async fn attempt(&self) -> Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.failures {
                return Ok(());
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(TransportError::Throttled(format!("attempt {call}")))
        }
    }

    #[async_trait]
    impl MessageTransport for FlakyTransport {
        async fn receive(&self, _: &str, _: &ReceiveOptions) -> Result<Vec<Message>, TransportError> {
            Ok(Vec::new())
        }

        async fn delete(&self, _: &str, _: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, _: &SendRequest) -> Result<String, TransportError> {
            self.attempt().await.map(|_| "msg-1".to_string())
        }

        async fn send_batch(
            &self,
            _: &str,
            entries: &[BatchEntry],
        ) -> Result<BatchSendOutput, TransportError> {
            self.attempt().await?;
            self.batches.lock().unwrap().push(entries.len());
            Ok(BatchSendOutput {
                successful: entries.iter().map(|e| e.id.clone()).collect(),
                failed: Vec::new(),
            })
        }

        async fn change_visibility(&self, _: &str, _: &str, _: Duration) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn producer(transport: Arc<FlakyTransport>) -> Producer<FlakyTransport> {
        Producer::new(
            transport,
            ProducerConfig {
                queue_url: "q".into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_delay_then_succeeds() {
        let transport = Arc::new(FlakyTransport::new(2));
        let started = Instant::now();

        let id = producer(transport.clone()).send_message("hi", vec![]).await.unwrap();

        assert_eq!(id, "msg-1");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_after_three_attempts() {
        let transport = Arc::new(FlakyTransport::new(u32::MAX));

        let err = producer(transport.clone()).send_message("hi", vec![]).await.unwrap_err();

        assert!(matches!(
            err,
            SqsWorkerError::Transport(TransportError::Throttled(ref m)) if m == "attempt 2"
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sends_time_out_and_are_retried() {
        let transport = Arc::new(FlakyTransport::hanging(1));
        let started = Instant::now();
        let producer = Producer::new(
            transport.clone(),
            ProducerConfig {
                queue_url: "q".into(),
                send_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        )
        .unwrap();

        let id = producer.send_message("hi", vec![]).await.unwrap();

        assert_eq!(id, "msg-1");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        // 5s timeout, then 1s retry delay
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_batches_give_up_with_a_timeout() {
        let transport = Arc::new(FlakyTransport::hanging(u32::MAX));
        let entries = vec![BatchEntry::new("1", "a")];

        let err = producer(transport.clone()).send_messages_batch(entries).await.unwrap_err();

        assert!(matches!(
            err,
            SqsWorkerError::Transport(TransportError::Timeout(limit)) if limit == Duration::from_secs(30)
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert!(transport.batches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_retried_as_a_whole() {
        let transport = Arc::new(FlakyTransport::new(1));
        let entries = vec![BatchEntry::new("1", "a"), BatchEntry::new("2", "b")];

        producer(transport.clone()).send_messages_batch(entries).await.unwrap();

        assert_eq!(*transport.batches.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn oversized_and_empty_batches_are_rejected_locally() {
        let transport = Arc::new(FlakyTransport::new(0));
        let producer = producer(transport.clone());

        let too_many = (0..11).map(|i| BatchEntry::new(i.to_string(), "x")).collect();
        assert!(matches!(
            producer.send_messages_batch(too_many).await,
            Err(SqsWorkerError::InvalidBatch(_))
        ));
        assert!(matches!(
            producer.send_messages_batch(Vec::new()).await,
            Err(SqsWorkerError::InvalidBatch(_))
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_requires_queue_url_and_attempts() {
        assert!(ProducerConfig::default().validate().is_err());
        let config = ProducerConfig {
            queue_url: "q".into(),
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ProducerConfig {
            queue_url: "q".into(),
            send_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
