//! Service graph owned by the process bootstrap
//!
//! ```text
//! ingest → RateLimiter → LogQueue (server) → BatchReporter → [console, file, http]
//! ```
//!
//! Everything is built once in [`Pipeline::create`], background tasks are
//! spawned by [`Pipeline::start`], and [`Pipeline::shutdown`] drains in order.

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, RateLimitConfig};
use crate::metrics;
use crate::queue::LogQueue;
use crate::rate_limit::{spawn_cleanup_task, RateLimiter};
use crate::record::AppInfo;
use crate::reporter::{BatchReporter, Sink};
use crate::sinks::{ConsoleSink, FileSink, HttpSink};
use crate::store::{KeyValueStore, MemoryStore};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct Pipeline {
    instance_id: String,
    app: AppInfo,
    limiter: Arc<RateLimiter>,
    reporter: BatchReporter,
    queue: LogQueue,
    sinks: Vec<Arc<dyn Sink>>,
    cleanup_interval: Duration,
    accepting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build the graph with an in-process store and the system clock
    pub fn create(config: &Config) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()), Arc::new(SystemClock::new()))
    }

    pub fn with_store(config: &Config, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let instance_id = Uuid::new_v4().to_string();
        let app = AppInfo {
            name: config.app.name.clone(),
            version: config.app.version.clone(),
        };

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        if config.console.enabled {
            sinks.push(Arc::new(ConsoleSink::new(config.console.pretty)));
        }
        if config.file.enabled {
            sinks.push(Arc::new(FileSink::new(config.file.clone(), clock.clone())));
        }
        if config.http.enabled {
            sinks.push(Arc::new(HttpSink::new(
                config.http.clone(),
                app.clone(),
                instance_id.clone(),
            )?));
        }
        Ok(Self::from_parts(config, instance_id, sinks, store, clock))
    }

    /// Assemble around caller-provided sinks
    pub fn from_parts(
        config: &Config,
        instance_id: String,
        sinks: Vec<Arc<dyn Sink>>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), store, clock.clone()));
        let reporter = BatchReporter::new(config.batch.clone(), sinks.clone(), clock);
        let queue = LogQueue::server(config.queue.clone(), reporter.clone());

        Self {
            instance_id,
            app: AppInfo {
                name: config.app.name.clone(),
                version: config.app.version.clone(),
            },
            limiter,
            reporter,
            queue,
            sinks,
            cleanup_interval: Duration::from_secs(config.rate_limit.cleanup_interval_secs.max(1)),
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the rate-limit sweep and the dropped-batch consumer
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        if self.limiter.config().enabled {
            tasks.push(spawn_cleanup_task(self.limiter.clone(), self.cleanup_interval));
        }

        let mut failures = self.reporter.failures();
        tasks.push(tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                tracing::error!(
                    batch_id = %failure.batch_id,
                    sink = %failure.sink,
                    records = failure.records,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Log batch lost"
                );
            }
        }));

        tracing::info!(
            instance_id = %self.instance_id,
            sinks = ?self.sinks.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            "Pipeline started"
        );
    }

    /// Stop intake and push everything buffered to the sinks
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        tracing::info!(
            queued = self.queue.len(),
            buffered = self.reporter.buffered(),
            "Draining log pipeline"
        );

        self.queue.drain().await;
        self.reporter.force_flush().await;
        self.reporter.retry_pending_now().await;

        for sink in &self.sinks {
            if let Err(e) = sink.force_flush().await {
                tracing::warn!(sink = sink.name(), error = %e, "Sink flush failed during shutdown");
            }
        }

        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        tracing::info!("Pipeline stopped");
    }

    /// Apply new rate-limit settings without touching stored windows
    pub fn reload(&self, config: &Config) {
        self.reload_rate_limits(config.rate_limit.clone());
    }

    pub fn reload_rate_limits(&self, config: RateLimitConfig) {
        self.limiter.reload(config);
        tracing::info!("Rate limit configuration reloaded");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn app(&self) -> &AppInfo {
        &self.app
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn reporter(&self) -> &BatchReporter {
        &self.reporter
    }

    pub fn queue(&self) -> &LogQueue {
        &self.queue
    }

    /// Hand accepted records to the server queue
    pub fn submit(&self, app: &str, records: Vec<crate::record::LogRecord>) {
        metrics::record_ingested(app, records.len());
        self.queue.enqueue_all(records);
    }
}
