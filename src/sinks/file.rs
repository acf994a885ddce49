use crate::clock::Clock;
use crate::config::FileSinkConfig;
use crate::error::DeliveryError;
use crate::record::LogRecord;
use crate::reporter::Sink;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

/// Newline-delimited JSON writer with date- and size-based rotation
///
/// `log` appends to an in-memory buffer that is written on an interval or
/// once it grows past `buffer_max_size_bytes`. All writes go through one
/// async mutex, so concurrent flushes never interleave on disk.
#[derive(Clone)]
pub struct FileSink {
    inner: Arc<Inner>,
}

struct Inner {
    config: FileSinkConfig,
    clock: Arc<dyn Clock>,
    pending: Mutex<Pending>,
    writer: tokio::sync::Mutex<Option<OpenFile>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    retry: Mutex<Option<JoinHandle<()>>>,
    failed_writes: AtomicU32,
}

#[derive(Default)]
struct Pending {
    data: String,
}

struct OpenFile {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileSink {
    pub fn new(config: FileSinkConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                pending: Mutex::new(Pending::default()),
                writer: tokio::sync::Mutex::new(None),
                flusher: Mutex::new(None),
                retry: Mutex::new(None),
                failed_writes: AtomicU32::new(0),
            }),
        }
    }

    /// Buffer one record
    pub fn append(&self, record: &LogRecord) -> Result<(), DeliveryError> {
        let line = self.inner.render(record)?;
        let size = {
            let mut pending = lock(&self.inner.pending);
            pending.data.push_str(&line);
            pending.data.len()
        };

        self.inner.ensure_flusher();
        if size >= self.inner.config.buffer_max_size_bytes {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.flush_pending().await {
                    tracing::warn!(error = %e, "Size-triggered file flush failed");
                }
            });
        }
        Ok(())
    }

    /// Bytes waiting in the buffer
    pub fn buffered_bytes(&self) -> usize {
        lock(&self.inner.pending).data.len()
    }

    /// Path the next write goes to
    pub fn current_path(&self) -> PathBuf {
        self.inner.path_for(self.inner.now())
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn log(&self, record: LogRecord) -> Result<(), DeliveryError> {
        self.append(&record)
    }

    /// Writes straight through; the caller owns retry
    async fn log_batch(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut data = String::new();
        for record in records {
            data.push_str(&self.inner.render(record)?);
        }
        self.inner.write(&data).await
    }

    async fn flush(&self) -> Result<(), DeliveryError> {
        self.inner.flush_pending().await
    }

    /// Stop timers, write the buffer once and close the file
    async fn force_flush(&self) -> Result<(), DeliveryError> {
        for slot in [&self.inner.flusher, &self.inner.retry] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }

        let result = self.inner.flush_pending().await;

        let mut writer = self.inner.writer.lock().await;
        if let Some(mut open) = writer.take() {
            open.file.flush().await?;
            open.file.sync_all().await?;
            tracing::debug!(path = %open.path.display(), "Closed log file");
        }
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// One JSON line; configured static fields never override record fields
    fn render(&self, record: &LogRecord) -> Result<String, DeliveryError> {
        let mut value = serde_json::to_value(record)?;
        if let Value::Object(map) = &mut value {
            for (key, field) in &self.config.additional_fields {
                map.entry(key.clone()).or_insert_with(|| field.clone());
            }
        }
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');
        Ok(line)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.clock.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn path_for(&self, now: DateTime<Utc>) -> PathBuf {
        Path::new(&self.config.directory).join(format_file_name(&self.config.file_name_format, now))
    }

    fn ensure_flusher(self: &Arc<Self>) {
        let mut flusher = lock(&self.flusher);
        if flusher.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.flush_interval_ms.max(1));
        *flusher = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = inner.flush_pending().await {
                    tracing::warn!(error = %e, "Interval file flush failed");
                }
            }
        }));
    }

    /// Write the buffer; on failure put it back and schedule a retry
    async fn flush_pending(self: &Arc<Self>) -> Result<(), DeliveryError> {
        let data = std::mem::take(&mut lock(&self.pending).data);
        if data.is_empty() {
            return Ok(());
        }

        match self.write(&data).await {
            Ok(()) => {
                self.failed_writes.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                let failures = self.failed_writes.fetch_add(1, Ordering::SeqCst) + 1;
                if failures > self.config.max_write_retries {
                    self.failed_writes.store(0, Ordering::SeqCst);
                    tracing::error!(
                        bytes = data.len(),
                        attempts = failures,
                        error = %e,
                        "Discarding log data after repeated write failures"
                    );
                    return Err(e);
                }

                {
                    let mut pending = lock(&self.pending);
                    let newer = std::mem::take(&mut pending.data);
                    pending.data = data;
                    pending.data.push_str(&newer);
                }
                tracing::warn!(attempt = failures, error = %e, "File write failed, will retry");
                self.schedule_retry();
                Err(e)
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let mut retry = lock(&self.retry);
        if retry.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = Duration::from_millis(self.config.flush_interval_ms.max(1));
        *retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                // Release the slot so a failed retry can schedule the next one
                drop(lock(&inner.retry).take());
                let _ = inner.flush_pending().await;
            }
        }));
    }

    /// Serialized append with rotation
    async fn write(&self, data: &str) -> Result<(), DeliveryError> {
        let mut writer = self.writer.lock().await;
        let now = self.now();
        let path = self.path_for(now);

        if writer.as_ref().map(|open| &open.path) != Some(&path) {
            if let Some(mut previous) = writer.take() {
                previous.file.flush().await?;
            }
            fs::create_dir_all(&self.config.directory).await?;
            *writer = Some(open_append(&path).await?);
        }

        let Some(open) = writer.as_mut() else {
            return Ok(());
        };

        let incoming = data.len() as u64;
        if open.size > 0 && open.size + incoming > self.config.max_size_bytes {
            open.file.flush().await?;
            let rotated = free_rotated_path(&path, now).await;
            fs::rename(&path, &rotated).await?;
            tracing::info!(
                from = %path.display(),
                to = %rotated.display(),
                size = open.size,
                "Rotated log file"
            );
            *open = open_append(&path).await?;
        }

        open.file.write_all(data.as_bytes()).await?;
        open.file.flush().await?;
        open.size += incoming;
        Ok(())
    }
}

async fn open_append(path: &Path) -> Result<OpenFile, DeliveryError> {
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    let size = file.metadata().await?.len();
    Ok(OpenFile {
        path: path.to_path_buf(),
        file,
        size,
    })
}

/// Expand `{YYYY}`, `{MM}`, `{DD}` and `{HH}`
pub fn format_file_name(template: &str, now: DateTime<Utc>) -> String {
    template
        .replace("{YYYY}", &now.format("%Y").to_string())
        .replace("{MM}", &now.format("%m").to_string())
        .replace("{DD}", &now.format("%d").to_string())
        .replace("{HH}", &now.format("%H").to_string())
}

/// First rotation target that does not exist yet
///
/// Rotations within the same millisecond get a `-1`, `-2`, ... suffix.
async fn free_rotated_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut seq = 0;
    loop {
        let candidate = rotated_path(path, now, seq);
        if fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
        seq += 1;
    }
}

/// `app.log` → `app.20240102-030405-678.log`, or `app.20240102-030405-678-2.log` for `seq` 2
fn rotated_path(path: &Path, now: DateTime<Utc>, seq: u32) -> PathBuf {
    let mut stamp = now.format("%Y%m%d-%H%M%S-%3f").to_string();
    if seq > 0 {
        stamp = format!("{}-{}", stamp, seq);
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("log");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}.{}", stem, stamp, ext),
        None => format!("{}.{}", stem, stamp),
    };
    path.with_file_name(name)
}
