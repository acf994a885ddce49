use super::{DeliveryFailure, RetryPolicy, RetryState, Sink, SortedBuffer};
use crate::clock::Clock;
use crate::config::BatchConfig;
use crate::error::DeliveryError;
use crate::metrics;
use crate::record::LogRecord;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Time-ordered buffer with scheduled fan-out to sinks
///
/// Flush triggers:
/// - size: the buffer reaches `max_size`; the eligible prefix is flushed
///   right away, or a flush is scheduled for when the oldest record clears
///   the sorting window
/// - age: a `max_age` timer armed whenever records are buffered and no
///   timer is pending
/// - explicit: [`flush`](Self::flush) and [`force_flush`](Self::force_flush)
///
/// Only one flush runs at a time. Cloning yields another handle to the same
/// reporter.
#[derive(Clone)]
pub struct BatchReporter {
    inner: Arc<Inner>,
}

struct Inner {
    config: BatchConfig,
    sinks: Vec<Arc<dyn Sink>>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    state: Mutex<State>,
    flush_lock: tokio::sync::Mutex<()>,
    retries: DashMap<Uuid, PendingRetry>,
    failures: Mutex<Option<mpsc::UnboundedSender<DeliveryFailure>>>,
}

#[derive(Default)]
struct State {
    buffer: SortedBuffer,
    timer: Option<FlushTimer>,
    next_timer_id: u64,
}

struct FlushTimer {
    id: u64,
    due_ms: i64,
    handle: JoinHandle<()>,
}

/// A batch parked on its backoff timer
struct PendingRetry {
    state: RetryState,
    records: Arc<Vec<LogRecord>>,
    sinks: Vec<Arc<dyn Sink>>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Arm {
    /// Leave a pending timer alone
    IfIdle,
    /// Replace a pending timer that would fire later
    IfSooner,
}

impl BatchReporter {
    pub fn new(config: BatchConfig, sinks: Vec<Arc<dyn Sink>>, clock: Arc<dyn Clock>) -> Self {
        let policy = RetryPolicy::new(config.max_retries, Duration::from_millis(config.retry_delay_ms));
        Self {
            inner: Arc::new(Inner {
                config,
                sinks,
                clock,
                policy,
                state: Mutex::new(State::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                retries: DashMap::new(),
                failures: Mutex::new(None),
            }),
        }
    }

    /// Buffer records; never blocks on delivery
    pub fn enqueue(&self, records: Vec<LogRecord>) {
        self.inner.enqueue(records);
    }

    /// Flush the part of the buffer that has cleared the sorting window
    ///
    /// Returns immediately if another flush is running.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Wait for a running flush, then deliver the whole buffer
    ///
    /// A no-op on an empty buffer.
    pub async fn force_flush(&self) {
        self.inner.force_flush().await;
    }

    /// Receiver for batches dropped after their last retry
    ///
    /// Each call replaces the previous channel.
    pub fn failures(&self) -> mpsc::UnboundedReceiver<DeliveryFailure> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.failures) = Some(tx);
        rx
    }

    pub fn buffered(&self) -> usize {
        self.inner.state().buffer.len()
    }

    pub fn pending_retries(&self) -> usize {
        self.inner.retries.len()
    }

    pub fn retry_states(&self) -> Vec<RetryState> {
        self.inner.retries.iter().map(|e| e.value().state.clone()).collect()
    }

    /// Cancel every backoff timer and run those retries now, as the final attempt
    ///
    /// Batches that still fail are dropped and reported. Used on shutdown.
    pub async fn retry_pending_now(&self) {
        self.inner.retry_pending_now().await;
    }
}

#[async_trait]
impl Sink for BatchReporter {
    fn name(&self) -> &str {
        "reporter"
    }

    async fn log(&self, record: LogRecord) -> Result<(), DeliveryError> {
        self.enqueue(vec![record]);
        Ok(())
    }

    async fn log_batch(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
        self.enqueue(records.to_vec());
        Ok(())
    }

    async fn flush(&self) -> Result<(), DeliveryError> {
        self.inner.flush().await;
        Ok(())
    }

    async fn force_flush(&self) -> Result<(), DeliveryError> {
        self.inner.force_flush().await;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One parallel delivery attempt; returns the sinks that failed with their errors
async fn attempt_sinks(
    batch_id: Uuid,
    records: &Arc<Vec<LogRecord>>,
    sinks: Vec<Arc<dyn Sink>>,
    attempt: u32,
) -> Vec<(Arc<dyn Sink>, String)> {
    let outcomes = join_all(sinks.into_iter().map(|sink| {
        let records = records.clone();
        async move {
            let started = Instant::now();
            let result = sink.log_batch(records.as_slice()).await;
            (sink, result, started.elapsed())
        }
    }))
    .await;

    let mut failed = Vec::new();
    for (sink, result, elapsed) in outcomes {
        match result {
            Ok(()) => metrics::record_flush(sink.name(), elapsed),
            Err(e) => {
                metrics::record_delivery_failure(sink.name());
                tracing::warn!(
                    batch_id = %batch_id,
                    sink = sink.name(),
                    attempt = attempt,
                    error = %e,
                    "Batch delivery failed"
                );
                failed.push((sink, e.to_string()));
            }
        }
    }
    failed
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn cutoff(&self) -> i64 {
        self.clock.now_ms() - self.config.sorting_window_ms as i64
    }

    fn accepts(&self, record: &LogRecord) -> bool {
        self.config
            .levels
            .as_ref()
            .map_or(true, |levels| levels.contains(&record.level))
    }

    fn enqueue(self: &Arc<Self>, records: Vec<LogRecord>) {
        let mut state = self.state();
        let mut added = false;
        for record in records.into_iter().filter(|r| self.accepts(r)) {
            state.buffer.insert(record);
            added = true;
        }
        if !added {
            return;
        }

        if state.buffer.len() >= self.config.max_size {
            let oldest = state.buffer.oldest_time().unwrap_or(i64::MAX);
            let cutoff = self.cutoff();
            if oldest <= cutoff {
                drop(state);
                let inner = self.clone();
                tokio::spawn(async move { inner.flush().await });
            } else {
                self.arm(&mut state, oldest - cutoff, Arm::IfSooner);
            }
        } else {
            self.arm(&mut state, self.config.max_age_ms as i64, Arm::IfIdle);
        }
    }

    fn arm(self: &Arc<Self>, state: &mut State, delay_ms: i64, mode: Arm) {
        let delay_ms = delay_ms.max(0);
        let due_ms = self.clock.now_ms() + delay_ms;

        if let Some(timer) = &state.timer {
            if mode == Arm::IfIdle || timer.due_ms <= due_ms {
                return;
            }
            timer.handle.abort();
        }

        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let weak: Weak<Inner> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.state();
                if state.timer.as_ref().map(|t| t.id) != Some(id) {
                    return;
                }
                state.timer = None;
            }
            inner.flush().await;
        });

        state.timer = Some(FlushTimer { id, due_ms, handle });
    }

    async fn flush(self: &Arc<Self>) {
        let Ok(guard) = self.flush_lock.try_lock() else {
            tracing::trace!("Flush already in progress");
            return;
        };

        let batch = {
            let cutoff = self.cutoff();
            self.state().buffer.take_eligible(cutoff)
        };
        if !batch.is_empty() {
            self.clone()
                .deliver(Uuid::new_v4(), Arc::new(batch), self.sinks.clone(), 0)
                .await;
        }
        drop(guard);

        self.reschedule();
    }

    fn reschedule(self: &Arc<Self>) {
        let mut state = self.state();
        let Some(oldest) = state.buffer.oldest_time() else {
            return;
        };
        if state.buffer.len() >= self.config.max_size {
            let delay = oldest - self.cutoff();
            self.arm(&mut state, delay, Arm::IfSooner);
        } else {
            self.arm(&mut state, self.config.max_age_ms as i64, Arm::IfIdle);
        }
    }

    async fn force_flush(self: &Arc<Self>) {
        let _guard = self.flush_lock.lock().await;

        let batch = {
            let mut state = self.state();
            if let Some(timer) = state.timer.take() {
                timer.handle.abort();
            }
            state.buffer.take_all()
        };
        if batch.is_empty() {
            return;
        }

        tracing::debug!(records = batch.len(), "Force flushing reporter buffer");
        self.clone()
            .deliver(Uuid::new_v4(), Arc::new(batch), self.sinks.clone(), 0)
            .await;
    }

    /// Hand one batch to `sinks` in parallel; failed sinks go to retry
    fn deliver(
        self: Arc<Self>,
        batch_id: Uuid,
        records: Arc<Vec<LogRecord>>,
        sinks: Vec<Arc<dyn Sink>>,
        attempt: u32,
    ) -> BoxFuture<'static, ()> {
        async move {
            let failed = attempt_sinks(batch_id, &records, sinks, attempt).await;

            if failed.is_empty() {
                if attempt > 0 {
                    tracing::info!(batch_id = %batch_id, attempt = attempt, "Batch delivered after retry");
                }
                self.retries.remove(&batch_id);
                return;
            }

            self.retry_or_drop(batch_id, records, failed, attempt);
        }
        .boxed()
    }

    fn retry_or_drop(
        self: Arc<Self>,
        batch_id: Uuid,
        records: Arc<Vec<LogRecord>>,
        failed: Vec<(Arc<dyn Sink>, String)>,
        attempt: u32,
    ) {
        let next_delay = if self.config.retry_on_failure {
            self.policy.next_delay(attempt)
        } else {
            None
        };

        let Some(delay) = next_delay else {
            self.retries.remove(&batch_id);
            self.drop_batch(batch_id, records.len(), failed, attempt);
            return;
        };

        let sinks: Vec<Arc<dyn Sink>> = failed.into_iter().map(|(sink, _)| sink).collect();
        tracing::debug!(
            batch_id = %batch_id,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling batch retry"
        );

        // The entry stays locked until the timer handle is stored
        let mut entry = self.retries.entry(batch_id).insert(PendingRetry {
            state: RetryState {
                batch_id,
                attempt: attempt + 1,
                next_delay: delay,
                sinks: sinks.iter().map(|s| s.name().to_string()).collect(),
            },
            records: records.clone(),
            sinks: sinks.clone(),
            timer: None,
        });
        let inner = self.clone();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.deliver(batch_id, records, sinks, attempt + 1).await;
        }));
    }

    async fn retry_pending_now(self: &Arc<Self>) {
        let ids: Vec<Uuid> = self.retries.iter().map(|e| *e.key()).collect();
        for batch_id in ids {
            let Some((_, pending)) = self.retries.remove(&batch_id) else {
                continue;
            };
            if let Some(timer) = pending.timer {
                timer.abort();
            }

            let attempt = pending.state.attempt;
            tracing::info!(batch_id = %batch_id, attempt = attempt, "Running pending retry before shutdown");
            let failed = attempt_sinks(batch_id, &pending.records, pending.sinks, attempt).await;
            if !failed.is_empty() {
                self.drop_batch(batch_id, pending.records.len(), failed, attempt);
            }
        }
    }

    fn drop_batch(&self, batch_id: Uuid, records: usize, failed: Vec<(Arc<dyn Sink>, String)>, attempt: u32) {
        for (sink, error) in failed {
            metrics::record_batch_dropped(sink.name());
            tracing::error!(
                batch_id = %batch_id,
                sink = sink.name(),
                records = records,
                attempts = attempt + 1,
                error = %error,
                "Dropping batch after final delivery attempt"
            );
            self.report(DeliveryFailure {
                batch_id,
                sink: sink.name().to_string(),
                records,
                attempts: attempt + 1,
                error,
            });
        }
    }

    fn report(&self, failure: DeliveryFailure) {
        let mut sender = lock(&self.failures);
        if let Some(tx) = sender.as_ref() {
            if tx.send(failure).is_err() {
                *sender = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::record::level;
    use crate::trace::new_context;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records every delivery; fails the first `fail_first` attempts
    struct TestSink {
        name: &'static str,
        fail_first: u32,
        calls: AtomicU32,
        delivered: Mutex<Vec<Vec<LogRecord>>>,
        attempts_at: Mutex<Vec<tokio::time::Instant>>,
    }

    impl TestSink {
        fn new(name: &'static str, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_first,
                calls: AtomicU32::new(0),
                delivered: Mutex::new(Vec::new()),
                attempts_at: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn batches(&self) -> Vec<Vec<LogRecord>> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for TestSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn log_batch(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
            self.attempts_at.lock().unwrap().push(tokio::time::Instant::now());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(DeliveryError::Http {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.delivered.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    fn config() -> BatchConfig {
        BatchConfig {
            max_size: 100,
            max_age_ms: 5000,
            sorting_window_ms: 1000,
            retry_on_failure: true,
            max_retries: 3,
            retry_delay_ms: 1000,
            levels: None,
        }
    }

    fn reporter(config: BatchConfig, sinks: Vec<Arc<dyn Sink>>) -> (BatchReporter, Arc<SystemClock>) {
        let clock = Arc::new(SystemClock::new());
        (BatchReporter::new(config, sinks, clock.clone()), clock)
    }

    fn record(time: i64, message: &str) -> LogRecord {
        LogRecord::new(time, level::INFO, message, new_context())
    }

    fn times(batch: &[LogRecord]) -> Vec<i64> {
        batch.iter().map(|r| r.time).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_takes_only_eligible_prefix() {
        let sink = TestSink::new("test", 0);
        let (reporter, clock) = reporter(config(), vec![sink.clone()]);
        let now = clock.now_ms();

        reporter.enqueue(vec![
            record(now - 3000, "c"),
            record(now, "fresh"),
            record(now - 5000, "a"),
            record(now - 4000, "b"),
        ]);
        reporter.flush().await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(times(&batches[0]), vec![now - 5000, now - 4000, now - 3000]);
        assert_eq!(reporter.buffered(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_then_drop() {
        let sink = TestSink::new("flaky", u32::MAX);
        let (reporter, clock) = reporter(config(), vec![sink.clone()]);
        let mut failures = reporter.failures();

        reporter.enqueue(vec![record(clock.now_ms() - 2000, "doomed")]);
        reporter.flush().await;
        assert_eq!(reporter.pending_retries(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(sink.calls(), 4);
        let at = sink.attempts_at.lock().unwrap().clone();
        let gaps: Vec<u128> = at.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![1000, 2000, 4000]);

        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.sink, "flaky");
        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.records, 1);
        assert_eq!(reporter.pending_retries(), 0);

        // Dropped batch never comes back
        reporter.force_flush().await;
        reporter.flush().await;
        assert_eq!(sink.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_failed_sinks_are_retried() {
        let steady = TestSink::new("steady", 0);
        let flaky = TestSink::new("flaky", 1);
        let (reporter, clock) = reporter(config(), vec![steady.clone(), flaky.clone()]);

        reporter.enqueue(vec![record(clock.now_ms() - 2000, "x")]);
        reporter.flush().await;
        assert_eq!(steady.calls(), 1);
        assert_eq!(flaky.calls(), 1);
        assert_eq!(reporter.retry_states()[0].sinks, vec!["flaky".to_string()]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(steady.calls(), 1);
        assert_eq!(flaky.calls(), 2);
        assert_eq!(flaky.batches().len(), 1);
        assert_eq!(reporter.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_retry_runs_immediately_on_request() {
        let sink = TestSink::new("flaky", 1);
        let (reporter, clock) = reporter(config(), vec![sink.clone()]);

        reporter.enqueue(vec![record(clock.now_ms() - 2000, "late")]);
        reporter.flush().await;
        assert_eq!(reporter.pending_retries(), 1);

        reporter.retry_pending_now().await;
        assert_eq!(sink.calls(), 2);
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(reporter.pending_retries(), 0);

        // The cancelled timer never fires
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_retry_failing_again_is_dropped() {
        let sink = TestSink::new("flaky", u32::MAX);
        let (reporter, clock) = reporter(config(), vec![sink.clone()]);
        let mut failures = reporter.failures();

        reporter.enqueue(vec![record(clock.now_ms() - 2000, "doomed")]);
        reporter.flush().await;
        reporter.retry_pending_now().await;

        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.attempts, 2);
        assert_eq!(reporter.pending_retries(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_when_disabled() {
        let sink = TestSink::new("flaky", u32::MAX);
        let cfg = BatchConfig {
            retry_on_failure: false,
            ..config()
        };
        let (reporter, clock) = reporter(cfg, vec![sink.clone()]);
        let mut failures = reporter.failures();

        reporter.enqueue(vec![record(clock.now_ms() - 2000, "x")]);
        reporter.flush().await;

        assert_eq!(reporter.pending_retries(), 0);
        assert_eq!(failures.try_recv().unwrap().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_empty_is_noop() {
        let sink = TestSink::new("test", 0);
        let (reporter, _) = reporter(config(), vec![sink.clone()]);

        reporter.force_flush().await;
        reporter.force_flush().await;
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_ignores_sorting_window() {
        let sink = TestSink::new("test", 0);
        let (reporter, clock) = reporter(config(), vec![sink.clone()]);
        let now = clock.now_ms();

        reporter.enqueue(vec![record(now, "b"), record(now - 10, "a")]);
        reporter.force_flush().await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(times(&batches[0]), vec![now - 10, now]);
        assert_eq!(reporter.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_eligible_records() {
        let sink = TestSink::new("test", 0);
        let cfg = BatchConfig { max_size: 3, ..config() };
        let (reporter, clock) = reporter(cfg, vec![sink.clone()]);
        let old = clock.now_ms() - 2000;

        reporter.enqueue(vec![record(old, "a"), record(old + 1, "b")]);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.calls(), 0);

        reporter.enqueue(vec![record(old + 2, "c")]);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.batches()[0].len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_waits_for_sorting_window() {
        let sink = TestSink::new("test", 0);
        let cfg = BatchConfig { max_size: 2, ..config() };
        let (reporter, clock) = reporter(cfg, vec![sink.clone()]);
        let now = clock.now_ms();

        reporter.enqueue(vec![record(now, "a"), record(now, "b")]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.calls(), 0);

        // A late record with an earlier timestamp is sealed first
        reporter.enqueue(vec![record(now - 1, "late")]);
        tokio::time::sleep(Duration::from_millis(600)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(times(&batches[0]), vec![now - 1]);
        assert_eq!(times(&batches[1]), vec![now, now]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_timer_flushes() {
        let sink = TestSink::new("test", 0);
        let (reporter, clock) = reporter(config(), vec![sink.clone()]);

        reporter.enqueue(vec![record(clock.now_ms(), "a")]);
        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(sink.calls(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(reporter.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_filter() {
        let sink = TestSink::new("test", 0);
        let cfg = BatchConfig {
            levels: Some(vec![level::ERROR, level::FATAL]),
            ..config()
        };
        let (reporter, clock) = reporter(cfg, vec![sink.clone()]);
        let now = clock.now_ms();

        reporter.enqueue(vec![
            record(now, "info"),
            LogRecord::new(now, level::ERROR, "boom", new_context()),
        ]);
        assert_eq!(reporter.buffered(), 1);

        reporter.force_flush().await;
        assert_eq!(sink.batches()[0][0].message, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_as_sink() {
        let sink = TestSink::new("test", 0);
        let (reporter, clock) = reporter(config(), vec![sink.clone()]);
        let as_sink: Arc<dyn Sink> = Arc::new(reporter.clone());

        as_sink.log(record(clock.now_ms(), "one")).await.unwrap();
        as_sink.log_batch(&[record(clock.now_ms(), "two")]).await.unwrap();
        assert_eq!(reporter.buffered(), 2);

        as_sink.force_flush().await.unwrap();
        assert_eq!(sink.batches()[0].len(), 2);
    }
}
