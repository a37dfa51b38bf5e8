use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error};

/// Lock-free counters kept by a running consumer.
#[derive(Debug, Default)]
pub(crate) struct ConsumerStats {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    deleted: AtomicU64,
    dead_lettered: AtomicU64,
    delete_failures: AtomicU64,
    dead_letter_failures: AtomicU64,
    receive_errors: AtomicU64,
}

/// Point-in-time copy of a consumer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    /// Messages handed to a handler.
    pub received: u64,
    pub succeeded: u64,
    /// Handler errors, timeouts and panics.
    pub failed: u64,
    pub deleted: u64,
    /// Failed messages copied to the DLQ.
    pub dead_lettered: u64,
    pub delete_failures: u64,
    pub dead_letter_failures: u64,
    pub receive_errors: u64,
}

/// Which counter an event bumps.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Received,
    Succeeded,
    Failed,
    Deleted,
    DeadLettered,
    DeleteFailure,
    DeadLetterFailure,
    ReceiveError,
}

impl ConsumerStats {
    pub(crate) fn incr(&self, counter: Counter) {
        let cell = match counter {
            Counter::Received => &self.received,
            Counter::Succeeded => &self.succeeded,
            Counter::Failed => &self.failed,
            Counter::Deleted => &self.deleted,
            Counter::DeadLettered => &self.dead_lettered,
            Counter::DeleteFailure => &self.delete_failures,
            Counter::DeadLetterFailure => &self.dead_letter_failures,
            Counter::ReceiveError => &self.receive_errors,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
            dead_letter_failures: self.dead_letter_failures.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// Emits a `message_queue.error` event for a failed operation.
pub(crate) fn report_error_event(queue_url: &str, operation: &'static str, err: &dyn Display) {
    error!(
        event = "message_queue.error",
        queue_url = %queue_url,
        operation,
        error = %err,
        "Message queue operation failed"
    );
}

pub(crate) fn report_processed_message(queue_url: &str, message_id: &str) {
    debug!(
        event = "message_queue.processed",
        queue_url = %queue_url,
        message_id = %message_id,
        "Processed message"
    );
}
