//! Bounded in-memory queue in front of a delivery target
//!
//! The client variant delivers straight to an [`HttpSink`]; the server
//! variant feeds a [`BatchReporter`]. Producers never wait on delivery.

use crate::config::QueueConfig;
use crate::metrics;
use crate::record::LogRecord;
use crate::reporter::{BatchReporter, Sink};
use crate::sinks::{HttpSink, RetryingHttpSink};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct LogQueue {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    target: Arc<dyn Sink>,
    state: Mutex<State>,
    send_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct State {
    records: VecDeque<LogRecord>,
    timer: Option<JoinHandle<()>>,
}

impl LogQueue {
    pub fn new(config: QueueConfig, target: Arc<dyn Sink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                target,
                state: Mutex::new(State::default()),
                send_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Queue that posts batches to a remote ingestion endpoint, retrying each send
    pub fn client(config: QueueConfig, sink: Arc<HttpSink>) -> Self {
        Self::new(config, Arc::new(RetryingHttpSink::new(sink)))
    }

    /// Queue that feeds the local batch reporter
    pub fn server(config: QueueConfig, reporter: BatchReporter) -> Self {
        Self::new(config, Arc::new(reporter))
    }

    /// Add a record; the oldest records are dropped when the queue is full
    pub fn enqueue(&self, record: LogRecord) {
        self.enqueue_all(std::iter::once(record));
    }

    pub fn enqueue_all(&self, records: impl IntoIterator<Item = LogRecord>) {
        let mut state = self.inner.state();
        state.records.extend(records);

        let overflow = state.records.len().saturating_sub(self.inner.config.max_queue_size);
        if overflow > 0 {
            state.records.drain(..overflow);
            metrics::record_queue_dropped(overflow);
            tracing::warn!(dropped = overflow, "Log queue full, dropping oldest records");
        }

        self.inner.schedule_send(&mut state);
    }

    /// Deliver everything queued right now
    ///
    /// A no-op when the queue is empty or a send is already running.
    pub async fn send_logs(&self) -> bool {
        self.inner.send_logs().await
    }

    /// Wait for any running send, then deliver until the queue is empty or
    /// the target refuses
    pub async fn drain(&self) {
        let _guard = self.inner.send_lock.lock().await;
        if let Some(timer) = self.inner.state().timer.take() {
            timer.abort();
        }
        while self.inner.send_locked().await {}
    }

    pub fn len(&self) -> usize {
        self.inner.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_send(self: &Arc<Self>, state: &mut State) {
        if state.records.len() >= self.config.max_batch_size {
            let inner = self.clone();
            tokio::spawn(async move {
                inner.send_logs().await;
            });
        } else if state.timer.is_none() && !state.records.is_empty() {
            self.arm_timer(state);
        }
    }

    fn arm_timer(self: &Arc<Self>, state: &mut State) {
        let delay = Duration::from_millis(self.config.max_batch_age_ms);
        let weak = Arc::downgrade(self);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.state().timer = None;
                inner.send_logs().await;
            }
        }));
    }

    async fn send_logs(self: &Arc<Self>) -> bool {
        let Ok(_guard) = self.send_lock.try_lock() else {
            return false;
        };
        self.send_locked().await
    }

    /// Swap out the queue and deliver it; caller holds `send_lock`
    ///
    /// Returns true if a non-empty batch was delivered.
    async fn send_locked(self: &Arc<Self>) -> bool {
        let batch: Vec<LogRecord> = {
            let mut state = self.state();
            state.records.drain(..).collect()
        };
        if batch.is_empty() {
            return false;
        }

        match self.target.log_batch(&batch).await {
            Ok(()) => {
                let mut state = self.state();
                if !state.records.is_empty() {
                    self.schedule_send(&mut state);
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    target_sink = self.target.name(),
                    records = batch.len(),
                    error = %e,
                    "Queue delivery failed, keeping records for the next cycle"
                );

                let mut state = self.state();
                let newer = std::mem::take(&mut state.records);
                let mut restored: VecDeque<LogRecord> = batch.into();
                restored.extend(newer);

                let overflow = restored.len().saturating_sub(self.config.max_queue_size);
                if overflow > 0 {
                    restored.drain(..overflow);
                    metrics::record_queue_dropped(overflow);
                }
                state.records = restored;

                if state.timer.is_none() {
                    self.arm_timer(&mut state);
                }
                false
            }
        }
    }
}
