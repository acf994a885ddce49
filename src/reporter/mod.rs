//! Batching and reliable delivery
//!
//! A [`BatchReporter`] buffers records in time order and fans each sealed
//! batch out to a list of [`Sink`]s. Failed deliveries are retried with
//! exponential backoff; batches that exhaust their retries are dropped and
//! reported on the [`DeliveryFailure`] channel.

pub mod batch;
pub mod buffer;
pub mod retry;

pub use batch::BatchReporter;
pub use buffer::SortedBuffer;
pub use retry::{RetryPolicy, RetryState};

use crate::error::DeliveryError;
use crate::record::LogRecord;
use async_trait::async_trait;
use uuid::Uuid;

/// Destination for log records
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs and metric labels
    fn name(&self) -> &str;

    /// Accept a single record
    async fn log(&self, record: LogRecord) -> Result<(), DeliveryError> {
        self.log_batch(std::slice::from_ref(&record)).await
    }

    /// Deliver a batch; an error means the sink did not take it
    async fn log_batch(&self, records: &[LogRecord]) -> Result<(), DeliveryError>;

    /// Push out anything the sink buffers itself
    async fn flush(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Flush unconditionally and release resources (shutdown path)
    async fn force_flush(&self) -> Result<(), DeliveryError> {
        self.flush().await
    }
}

/// A batch that was dropped after its final attempt
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub batch_id: Uuid,
    pub sink: String,
    pub records: usize,
    pub attempts: u32,
    pub error: String,
}
