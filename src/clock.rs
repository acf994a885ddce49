//! Wall-clock source for window arithmetic and record ages

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub trait Clock: Send + Sync + 'static {
    /// Current time in Unix milliseconds
    fn now_ms(&self) -> i64;
}

/// Unix milliseconds from the system clock
pub fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Wall clock anchored on the tokio clock
///
/// The wall time is sampled once at construction and then advanced by the
/// tokio `Instant`, so paused-time tests move it together with timers.
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor_ms: i64,
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor_ms: current_millis(),
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as i64
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
