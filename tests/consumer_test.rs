use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rs_sqs_worker::transport::TransportError;
use rs_sqs_worker::{
    ConsumerClient, ConsumerConfig, DrainOutcome, FailedMessagePolicy, GenericError, InMemoryQueue,
    Message, MessageHandler, SqsWorkerError,
};
use tokio::time::Instant;

const SOURCE: &str = "memory://orders";
const DLQ: &str = "memory://orders-dlq";

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
}

#[derive(Clone, Default)]
struct Tally {
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Tally {
    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ScriptedHandler {
    behavior: Behavior,
    delay: Duration,
    tally: Tally,
}

impl ScriptedHandler {
    fn new(behavior: Behavior, delay: Duration, tally: &Tally) -> Self {
        ScriptedHandler {
            behavior,
            delay,
            tally: tally.clone(),
        }
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, _message: Message) -> Result<(), SqsWorkerError> {
        self.tally.started.fetch_add(1, Ordering::SeqCst);
        let now = self.tally.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.tally.running.fetch_sub(1, Ordering::SeqCst);
        self.tally.finished.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(GenericError::from("handler rejected message").into()),
            Behavior::Panic => panic!("handler exploded"),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(concurrency_factor: usize) -> ConsumerConfig {
    ConsumerConfig {
        queue_url: SOURCE.into(),
        dlq_url: Some(DLQ.into()),
        concurrency_factor,
        poll_interval: Duration::from_millis(10),
        wait_time_seconds: 0,
        ..Default::default()
    }
}

fn consumer(
    queue: &InMemoryQueue,
    handler: ScriptedHandler,
    config: ConsumerConfig,
) -> ConsumerClient<InMemoryQueue, ScriptedHandler> {
    ConsumerClient::new(Arc::new(queue.clone()), handler, config).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn successful_messages_are_deleted() {
    init_tracing();
    let queue = InMemoryQueue::new();
    for i in 0..3 {
        queue.push(SOURCE, format!("order-{i}"));
    }
    let tally = Tally::default();
    let consumer = consumer(&queue, ScriptedHandler::new(Behavior::Succeed, Duration::ZERO, &tally), config(4));

    consumer.start().unwrap();
    wait_until(|| consumer.stats().deleted == 3).await;
    consumer.stop().await;

    assert!(queue.is_empty(SOURCE));
    assert!(queue.is_empty(DLQ));
    let stats = consumer.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.succeeded, 3);
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_message_is_copied_to_dlq_once_and_hidden_in_source() {
    init_tracing();
    let queue = InMemoryQueue::new();
    queue.push(SOURCE, r#"{"order":7}"#);
    let tally = Tally::default();
    let consumer = consumer(&queue, ScriptedHandler::new(Behavior::Fail, Duration::ZERO, &tally), config(2));

    consumer.start().unwrap();
    wait_until(|| consumer.stats().dead_lettered == 1).await;
    // Give the loop a few more polls to prove the copy is not repeated.
    tokio::time::sleep(Duration::from_secs(5)).await;
    consumer.stop().await;

    assert_eq!(queue.bodies(DLQ), vec![r#"{"order":7}"#.to_string()]);
    assert_eq!(queue.len(SOURCE), 1, "failed message must not be deleted");
    assert_eq!(queue.visible_len(SOURCE), 0, "visibility is extended after the DLQ copy");
    assert_eq!(tally.started(), 1);
    assert_eq!(consumer.stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn leaving_failures_for_redelivery_can_duplicate_dlq_entries() {
    init_tracing();
    let queue = InMemoryQueue::new().with_visibility_timeout(Duration::from_secs(1));
    queue.push(SOURCE, "flaky");
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Fail, Duration::ZERO, &tally),
        ConsumerConfig {
            failed_message_policy: FailedMessagePolicy::LeaveForRedelivery,
            ..config(1)
        },
    );

    consumer.start().unwrap();
    wait_until(|| queue.len(DLQ) >= 2).await;
    consumer.stop().await;

    assert!(queue.bodies(DLQ).iter().all(|body| body == "flaky"));
    assert_eq!(queue.len(SOURCE), 1);
}

#[tokio::test(start_paused = true)]
async fn failure_without_dlq_leaves_message_in_source() {
    init_tracing();
    let queue = InMemoryQueue::new();
    queue.push(SOURCE, "no-dlq");
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Fail, Duration::ZERO, &tally),
        ConsumerConfig {
            dlq_url: None,
            ..config(1)
        },
    );

    consumer.start().unwrap();
    wait_until(|| consumer.stats().failed == 1).await;
    consumer.stop().await;

    assert_eq!(queue.len(SOURCE), 1);
    assert_eq!(consumer.stats().dead_lettered, 0);
}

#[tokio::test(start_paused = true)]
async fn in_flight_handlers_never_exceed_concurrency_factor() {
    init_tracing();
    let queue = InMemoryQueue::new();
    for i in 0..20 {
        queue.push(SOURCE, format!("job-{i}"));
    }
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::from_millis(50), &tally),
        config(3),
    );

    consumer.start().unwrap();
    wait_until(|| tally.finished() == 20).await;
    consumer.stop().await;

    assert_eq!(tally.peak(), 3);
    assert!(queue.is_empty(SOURCE));
}

#[tokio::test(start_paused = true)]
async fn single_worker_processes_a_message_end_to_end() {
    init_tracing();
    let queue = InMemoryQueue::new();
    queue.push(SOURCE, "hello");
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::from_millis(100), &tally),
        config(1),
    );

    consumer.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(tally.finished(), 1);
    assert!(queue.is_empty(SOURCE));
    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_in_flight_handlers() {
    init_tracing();
    let queue = InMemoryQueue::new();
    queue.push(SOURCE, "slow");
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::from_millis(500), &tally),
        config(2),
    );

    consumer.start().unwrap();
    wait_until(|| tally.started() == 1).await;
    assert_eq!(consumer.in_flight(), 1);

    consumer.stop().await;

    assert_eq!(tally.finished(), 1);
    assert_eq!(consumer.in_flight(), 0);
    assert!(!consumer.is_running());
    assert!(queue.is_empty(SOURCE));
}

#[tokio::test(start_paused = true)]
async fn stop_with_grace_reports_abandoned_handlers() {
    init_tracing();
    let queue = InMemoryQueue::new();
    queue.push(SOURCE, "stuck");
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::from_secs(10), &tally),
        ConsumerConfig {
            message_process_timeout: Duration::from_secs(60),
            ..config(1)
        },
    );

    consumer.start().unwrap();
    wait_until(|| tally.started() == 1).await;

    let outcome = consumer.stop_with_grace(Duration::from_millis(100)).await;
    assert_eq!(outcome, DrainOutcome::Abandoned { in_flight: 1 });
}

#[tokio::test(start_paused = true)]
async fn restart_after_abandoned_stop_keeps_the_concurrency_cap() {
    init_tracing();
    let queue = InMemoryQueue::new();
    for i in 0..6 {
        queue.push(SOURCE, format!("report-{i}"));
    }
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::from_secs(10), &tally),
        ConsumerConfig {
            max_number_of_messages: 1,
            message_process_timeout: Duration::from_secs(60),
            ..config(1)
        },
    );

    consumer.start().unwrap();
    wait_until(|| tally.started() == 1).await;

    let outcome = consumer.stop_with_grace(Duration::from_millis(100)).await;
    assert_eq!(outcome, DrainOutcome::Abandoned { in_flight: 1 });
    assert!(!consumer.is_running(), "poll loop exits even while waiting for a worker");

    consumer.start().unwrap();
    tokio::time::sleep(Duration::from_secs(35)).await;

    assert!(tally.started() >= 2, "restarted loop keeps processing");
    assert_eq!(tally.peak(), 1);
    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn start_is_rejected_until_the_poll_loop_exits() {
    init_tracing();
    let queue = InMemoryQueue::new();
    queue.push(SOURCE, "slow");
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::from_secs(10), &tally),
        ConsumerConfig {
            message_process_timeout: Duration::from_secs(60),
            ..config(1)
        },
    );

    consumer.start().unwrap();
    wait_until(|| tally.started() == 1).await;
    assert!(matches!(consumer.start(), Err(SqsWorkerError::AlreadyStarted)));

    let outcome = consumer.stop_with_grace(Duration::from_millis(100)).await;
    assert!(matches!(outcome, DrainOutcome::Abandoned { .. }));
    wait_until(|| consumer.in_flight() == 0).await;
    consumer.start().unwrap();
    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn handler_timeout_and_panic_count_as_failures() {
    init_tracing();
    let queue = InMemoryQueue::new();
    queue.push(SOURCE, "too-slow");
    let tally = Tally::default();
    let slow = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::from_secs(5), &tally),
        ConsumerConfig {
            message_process_timeout: Duration::from_millis(100),
            ..config(1)
        },
    );

    slow.start().unwrap();
    wait_until(|| slow.stats().dead_lettered == 1).await;
    slow.stop().await;
    assert_eq!(tally.finished(), 0);

    let queue = InMemoryQueue::new();
    queue.push(SOURCE, "explodes");
    let panicking = consumer(&queue, ScriptedHandler::new(Behavior::Panic, Duration::ZERO, &tally), config(1));

    panicking.start().unwrap();
    wait_until(|| panicking.stats().dead_lettered == 1).await;
    panicking.stop().await;
    assert_eq!(queue.bodies(DLQ), vec!["explodes".to_string()]);
    assert_eq!(panicking.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn max_polls_bounds_receive_calls() {
    init_tracing();
    let queue = InMemoryQueue::new();
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::ZERO, &tally),
        ConsumerConfig {
            max_polls: Some(3),
            ..config(1)
        },
    );

    consumer.start().unwrap();
    wait_until(|| !consumer.is_running()).await;

    assert_eq!(queue.receive_calls(), 3);
    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn throttled_receives_back_off_exponentially() {
    init_tracing();
    let queue = InMemoryQueue::new();
    queue.fail_next_receive(TransportError::Throttled("over limit".into()));
    queue.fail_next_receive(TransportError::Throttled("over limit".into()));
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::ZERO, &tally),
        ConsumerConfig {
            max_polls: Some(3),
            ..config(1)
        },
    );

    let started = Instant::now();
    consumer.start().unwrap();
    wait_until(|| !consumer.is_running()).await;
    let elapsed = started.elapsed();

    // 1s after the first throttle, 2s after the second.
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "elapsed {elapsed:?}");
    assert_eq!(consumer.stats().receive_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn other_receive_errors_retry_at_the_seed_delay() {
    init_tracing();
    let queue = InMemoryQueue::new();
    queue.fail_next_receive(TransportError::service("receive_message", "internal error"));
    queue.fail_next_receive(TransportError::service("receive_message", "internal error"));
    let tally = Tally::default();
    let consumer = consumer(
        &queue,
        ScriptedHandler::new(Behavior::Succeed, Duration::ZERO, &tally),
        ConsumerConfig {
            max_polls: Some(3),
            ..config(1)
        },
    );

    let started = Instant::now();
    consumer.start().unwrap();
    wait_until(|| !consumer.is_running()).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn start_is_rejected_while_running() {
    init_tracing();
    let queue = InMemoryQueue::new();
    let tally = Tally::default();
    let consumer = consumer(&queue, ScriptedHandler::new(Behavior::Succeed, Duration::ZERO, &tally), config(1));

    consumer.start().unwrap();
    assert!(matches!(consumer.start(), Err(SqsWorkerError::AlreadyStarted)));
    consumer.stop().await;

    consumer.start().unwrap();
    consumer.stop().await;
}

#[test]
fn invalid_config_is_rejected_on_construction() {
    let tally = Tally::default();
    let result = ConsumerClient::new(
        Arc::new(InMemoryQueue::new()),
        ScriptedHandler::new(Behavior::Succeed, Duration::ZERO, &tally),
        ConsumerConfig::default(),
    );
    assert!(matches!(result, Err(SqsWorkerError::InvalidConfig(_))));
}

#[test]
fn start_outside_a_runtime_fails() {
    let tally = Tally::default();
    let consumer = ConsumerClient::new(
        Arc::new(InMemoryQueue::new()),
        ScriptedHandler::new(Behavior::Succeed, Duration::ZERO, &tally),
        config(1),
    )
    .unwrap();
    assert!(matches!(consumer.start(), Err(SqsWorkerError::InitializationError(_))));
}
