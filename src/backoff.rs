//! Backoff policies for transport errors.
//!
//! Two shapes are used:
//! - [`AdaptiveBackoff`] keeps state across the consumer's poll loop: throttling
//!   doubles the delay up to the ceiling, any other error resets it to the base.
//! - [`BackoffPolicy::retry_delay`] is stateless and drives the producer's
//!   per-call retries and the task pool's retry schedule.
//!
//! Neither applies jitter.

use std::time::Duration;

use crate::transport::TransportError;

/// Base delay and ceiling of a backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    /// Policy guarding the consumer's receive calls.
    pub const CONSUMER: BackoffPolicy = BackoffPolicy {
        base: Duration::from_secs(1),
        ceiling: Duration::from_secs(30),
    };

    /// Policy guarding the producer's send retries.
    pub const PRODUCER: BackoffPolicy = BackoffPolicy {
        base: Duration::from_secs(1),
        ceiling: Duration::from_secs(10),
    };

    pub const fn new(base: Duration, ceiling: Duration) -> Self {
        BackoffPolicy { base, ceiling }
    }

    /// `base * 2^attempt`, capped at the ceiling. `attempt` is zero-based.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.ceiling)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::CONSUMER
    }
}

/// Stateful error classifier for a long running loop.
///
/// ```rust
/// use std::time::Duration;
/// use rs_sqs_worker::backoff::{AdaptiveBackoff, BackoffPolicy};
/// use rs_sqs_worker::transport::TransportError;
///
/// let mut backoff = AdaptiveBackoff::new(BackoffPolicy::CONSUMER);
/// let throttled = TransportError::Throttled("over limit".into());
/// assert_eq!(backoff.next_delay(&throttled), Duration::from_secs(1));
/// assert_eq!(backoff.next_delay(&throttled), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct AdaptiveBackoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
}

impl AdaptiveBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        AdaptiveBackoff {
            policy,
            current: None,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Delay chosen by the last classification, if any.
    pub fn current(&self) -> Option<Duration> {
        self.current
    }

    /// Classifies `error` and returns how long the caller should sleep.
    pub fn next_delay(&mut self, error: &TransportError) -> Duration {
        let next = match (error.is_throttling(), self.current) {
            (true, Some(current)) => current.saturating_mul(2).min(self.policy.ceiling),
            _ => self.policy.base.min(self.policy.ceiling),
        };
        self.current = Some(next);
        next
    }

    /// Classifies `error` and sleeps for the resulting delay.
    ///
    /// Only the calling task is suspended.
    pub async fn wait(&mut self, error: &TransportError) -> Duration {
        let delay = self.next_delay(error);
        tokio::time::sleep(delay).await;
        delay
    }

    /// Forgets any accumulated throttling state.
    pub fn reset(&mut self) {
        self.current = None;
    }
}
