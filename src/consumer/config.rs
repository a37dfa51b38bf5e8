use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::errors::SqsWorkerError;
use crate::transport::ReceiveOptions;

/// What happens to the source message after its body was copied to the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedMessagePolicy {
    /// Leave the delivery alone; the broker redelivers it once the visibility
    /// timeout runs out, which can produce duplicate DLQ entries.
    LeaveForRedelivery,
    /// Hide the delivery for the given duration so it is not redelivered while
    /// the DLQ copy is inspected.
    ExtendVisibility(Duration),
}

impl Default for FailedMessagePolicy {
    fn default() -> Self {
        FailedMessagePolicy::ExtendVisibility(Duration::from_secs(6 * 60 * 60))
    }
}

/// Configuration for the SQS consumer.
///
/// `queue_url` has no default and must always be set; everything else has a
/// production default. Use struct update syntax for the rest:
///
/// ```rust
/// use rs_sqs_worker::consumer::ConsumerConfig;
///
/// let config = ConsumerConfig {
///     queue_url: "https://sqs.us-east-1.amazonaws.com/123/orders".into(),
///     dlq_url: Some("https://sqs.us-east-1.amazonaws.com/123/orders-dlq".into()),
///     concurrency_factor: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to poll.
    pub queue_url: String,

    /// Dead-letter queue receiving the bodies of messages whose handler failed.
    pub dlq_url: Option<String>,

    /// Maximum number of handlers running at the same time.
    pub concurrency_factor: usize,

    /// Sleep between receive calls that returned no messages.
    pub poll_interval: Duration,

    /// Upper bound for a single handler call; exceeding it counts as a failure.
    pub message_process_timeout: Duration,

    /// The maximum number of messages to receive in a single request (1..=10).
    pub max_number_of_messages: i32,

    /// The wait time for long polling, in seconds (0..=20).
    pub wait_time_seconds: i32,

    /// First delay after a receive error.
    pub backoff_seed: Duration,

    /// Largest delay reached by repeated throttling.
    pub backoff_ceiling: Duration,

    /// Upper bound for one receive call.
    pub receive_timeout: Duration,

    /// Stop polling after this many receive calls. `None` polls until stopped.
    pub max_polls: Option<u64>,

    pub failed_message_policy: FailedMessagePolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            queue_url: String::new(),
            dlq_url: None,
            concurrency_factor: 10,
            poll_interval: Duration::from_secs(1),
            message_process_timeout: Duration::from_secs(30),
            max_number_of_messages: 10,
            wait_time_seconds: 20,
            backoff_seed: BackoffPolicy::CONSUMER.base,
            backoff_ceiling: BackoffPolicy::CONSUMER.ceiling,
            receive_timeout: Duration::from_secs(30),
            max_polls: None,
            failed_message_policy: FailedMessagePolicy::default(),
        }
    }
}

impl ConsumerConfig {
    /// Checks that every required field is set and in range.
    pub fn validate(&self) -> Result<(), SqsWorkerError> {
        let invalid = |msg: &str| Err(SqsWorkerError::InvalidConfig(msg.to_string()));

        if self.queue_url.trim().is_empty() {
            return invalid("queue_url is not set");
        }
        if self.dlq_url.as_deref().is_some_and(|url| url.trim().is_empty()) {
            return invalid("dlq_url is set but empty");
        }
        if self.dlq_url.as_deref() == Some(self.queue_url.as_str()) {
            return invalid("dlq_url must differ from queue_url");
        }
        if self.concurrency_factor == 0 {
            return invalid("concurrency_factor must be at least 1");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval is not set");
        }
        if self.message_process_timeout.is_zero() {
            return invalid("message_process_timeout is not set");
        }
        if !(1..=10).contains(&self.max_number_of_messages) {
            return invalid("max_number_of_messages must be between 1 and 10");
        }
        if !(0..=20).contains(&self.wait_time_seconds) {
            return invalid("wait_time_seconds must be between 0 and 20");
        }
        if self.backoff_seed.is_zero() {
            return invalid("backoff_seed is not set");
        }
        if self.backoff_ceiling < self.backoff_seed {
            return invalid("backoff_ceiling must not be below backoff_seed");
        }
        if self.receive_timeout.as_secs() <= u64::try_from(self.wait_time_seconds).unwrap_or(0) {
            return invalid("receive_timeout must exceed wait_time_seconds");
        }
        if self.max_polls == Some(0) {
            return invalid("max_polls must be at least 1 when set");
        }
        if let FailedMessagePolicy::ExtendVisibility(extension) = self.failed_message_policy {
            if extension.is_zero() || extension > Duration::from_secs(12 * 60 * 60) {
                return invalid("visibility extension must be between 1s and 12h");
            }
        }
        Ok(())
    }

    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_number_of_messages: self.max_number_of_messages,
            wait_time_seconds: self.wait_time_seconds,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_seed, self.backoff_ceiling)
    }

    /// Builds and validates a config from `SQS_*` environment variables.
    ///
    /// - `SQS_QUEUE_URL` (required)
    /// - `SQS_DLQ_URL`
    /// - `SQS_CONCURRENCY_FACTOR`
    /// - `SQS_POLL_INTERVAL_MS`
    /// - `SQS_MESSAGE_PROCESS_TIMEOUT_MS`
    /// - `SQS_MAX_NUMBER_OF_MESSAGES`
    /// - `SQS_WAIT_TIME_SECONDS`
    /// - `SQS_BACKOFF_SEED_MS`
    /// - `SQS_MAX_POLLS`
    pub fn from_env() -> Result<Self, SqsWorkerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, SqsWorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ConsumerConfig::default();
        let millis = |key: &str, default: Duration| -> Result<Duration, SqsWorkerError> {
            Ok(parse_var::<u64>(&lookup, key)?.map_or(default, Duration::from_millis))
        };

        let config = ConsumerConfig {
            queue_url: lookup("SQS_QUEUE_URL").unwrap_or_default(),
            dlq_url: lookup("SQS_DLQ_URL").filter(|url| !url.is_empty()),
            concurrency_factor: parse_var(&lookup, "SQS_CONCURRENCY_FACTOR")?
                .unwrap_or(defaults.concurrency_factor),
            poll_interval: millis("SQS_POLL_INTERVAL_MS", defaults.poll_interval)?,
            message_process_timeout: millis(
                "SQS_MESSAGE_PROCESS_TIMEOUT_MS",
                defaults.message_process_timeout,
            )?,
            max_number_of_messages: parse_var(&lookup, "SQS_MAX_NUMBER_OF_MESSAGES")?
                .unwrap_or(defaults.max_number_of_messages),
            wait_time_seconds: parse_var(&lookup, "SQS_WAIT_TIME_SECONDS")?
                .unwrap_or(defaults.wait_time_seconds),
            backoff_seed: millis("SQS_BACKOFF_SEED_MS", defaults.backoff_seed)?,
            max_polls: parse_var(&lookup, "SQS_MAX_POLLS")?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, SqsWorkerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SqsWorkerError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
    }
}
