use async_trait::async_trait;
use logrelay::{
    clock::{Clock, SystemClock},
    config::Config,
    error::DeliveryError,
    pipeline::Pipeline,
    record::{level, LogRecord},
    reporter::Sink,
    store::MemoryStore,
    trace::new_context,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingSink {
    fail: bool,
    calls: AtomicU32,
    batches: Mutex<Vec<Vec<LogRecord>>>,
}

impl RecordingSink {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            calls: AtomicU32::new(0),
            batches: Mutex::new(Vec::new()),
        })
    }

    fn messages(&self) -> Vec<Vec<String>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.iter().map(|r| r.message.clone()).collect())
            .collect()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        if self.fail {
            "broken"
        } else {
            "recording"
        }
    }

    async fn log_batch(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DeliveryError::Http {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        self.batches.lock().unwrap().push(records.to_vec());
        Ok(())
    }
}

fn pipeline(config: &Config, sink: Arc<RecordingSink>) -> (Pipeline, Arc<SystemClock>) {
    let clock = Arc::new(SystemClock::new());
    let pipeline = Pipeline::from_parts(
        config,
        "relay-pipeline".to_string(),
        vec![sink],
        Arc::new(MemoryStore::with_clock(clock.clone())),
        clock.clone(),
    );
    (pipeline, clock)
}

fn record(time: i64, message: &str) -> LogRecord {
    LogRecord::new(time, level::INFO, message, new_context())
}

#[tokio::test(start_paused = true)]
async fn test_flush_seals_only_records_outside_sorting_window() {
    let sink = RecordingSink::new(false);
    let (pipeline, clock) = pipeline(&Config::default(), sink.clone());
    let now = clock.now_ms();

    pipeline.submit(
        "web",
        vec![
            record(now, "fresh"),
            record(now - 3000, "t3"),
            record(now - 5000, "t1"),
            record(now - 4000, "t2"),
        ],
    );
    pipeline.queue().drain().await;
    pipeline.reporter().flush().await;

    assert_eq!(sink.messages(), vec![vec!["t1", "t2", "t3"]]);
    assert_eq!(pipeline.reporter().buffered(), 1);

    pipeline.shutdown().await;
    assert_eq!(sink.messages().last().unwrap(), &vec!["fresh".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_timers_deliver_without_explicit_flush() {
    let sink = RecordingSink::new(false);
    let (pipeline, clock) = pipeline(&Config::default(), sink.clone());
    pipeline.start();

    let now = clock.now_ms();
    pipeline.submit("web", vec![record(now - 2000, "b"), record(now - 2500, "a")]);

    // Queue age (1s) then reporter age (5s)
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(sink.messages(), vec![vec!["a", "b"]]);
    assert!(pipeline.queue().is_empty());
    assert_eq!(pipeline.reporter().buffered(), 0);
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_is_retried_with_backoff_then_dropped() {
    let sink = RecordingSink::new(true);
    let (pipeline, clock) = pipeline(&Config::default(), sink.clone());
    let mut failures = pipeline.reporter().failures();

    pipeline.submit("web", vec![record(clock.now_ms() - 2000, "doomed")]);
    pipeline.queue().drain().await;
    pipeline.reporter().flush().await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

    // 1s + 2s + 4s of backoff
    tokio::time::sleep(Duration::from_millis(7_500)).await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 4);

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.sink, "broken");
    assert_eq!(failure.attempts, 4);
    assert_eq!(failure.records, 1);

    pipeline.shutdown().await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_runs_scheduled_retries_once() {
    let sink = RecordingSink::new(true);
    let (pipeline, clock) = pipeline(&Config::default(), sink.clone());
    let mut failures = pipeline.reporter().failures();

    pipeline.submit("web", vec![record(clock.now_ms() - 2000, "in flight")]);
    pipeline.queue().drain().await;
    pipeline.reporter().flush().await;
    assert_eq!(pipeline.reporter().pending_retries(), 1);

    pipeline.shutdown().await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    assert_eq!(pipeline.reporter().pending_retries(), 0);
    assert_eq!(failures.try_recv().unwrap().attempts, 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_keeps_newest_records_in_order() {
    let mut config = Config::default();
    config.queue.max_queue_size = 3;
    config.queue.max_batch_size = 10;

    let sink = RecordingSink::new(false);
    let (pipeline, clock) = pipeline(&config, sink.clone());
    let now = clock.now_ms();

    pipeline.submit(
        "web",
        (1..=5).map(|i| record(now - 10_000 + i, &format!("m{}", i))).collect(),
    );
    assert_eq!(pipeline.queue().len(), 3);

    pipeline.shutdown().await;
    assert_eq!(sink.messages(), vec![vec!["m3", "m4", "m5"]]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_with_nothing_buffered_delivers_nothing() {
    let sink = RecordingSink::new(false);
    let (pipeline, _) = pipeline(&Config::default(), sink.clone());

    pipeline.shutdown().await;
    pipeline.reporter().force_flush().await;

    assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    assert!(!pipeline.is_accepting());
}
