//! Periodic sweep of expired rate-limit keys

use super::{RateLimiter, Tier};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub scanned: usize,
    pub removed: usize,
    /// Listed keys whose TTL ran out before they were read
    pub expired: usize,
    pub failed: usize,
}

/// Spawn the background sweep
///
/// The task never touches the request path; abort the handle on shutdown.
pub fn spawn_cleanup_task(limiter: Arc<RateLimiter>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let stats = limiter.cleanup().await;
            tracing::debug!(
                scanned = stats.scanned,
                removed = stats.removed,
                expired = stats.expired,
                failed = stats.failed,
                "Rate limit cleanup completed"
            );
        }
    })
}

impl RateLimiter {
    /// Remove expired and fully stale keys in bounded chunks
    ///
    /// Individual key failures are counted and skipped.
    pub async fn cleanup(&self) -> CleanupStats {
        let cfg = self.config();
        let prefix = format!("{}:", cfg.key_prefix);
        let mut stats = CleanupStats::default();

        let keys = match self.store().keys(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                crate::metrics::record_storage_error("cleanup");
                tracing::warn!(error = %e, "Rate limit cleanup could not list keys");
                return stats;
            }
        };

        let now = self.now_ms();
        let chunk_size = cfg.cleanup_chunk_size.max(1);

        for chunk in keys.chunks(chunk_size) {
            for key in chunk {
                stats.scanned += 1;

                let value = match self.store().get(key).await {
                    Ok(Some(value)) => value,
                    Ok(None) => {
                        stats.expired += 1;
                        continue;
                    }
                    Err(e) => {
                        stats.failed += 1;
                        tracing::debug!(key = %key, error = %e, "Skipping key during cleanup");
                        continue;
                    }
                };

                let Some(window_secs) = window_seconds_for(&cfg, &prefix, key) else {
                    continue;
                };
                let cutoff = now - window_secs * 1000;
                let stale = serde_json::from_value::<Vec<i64>>(value)
                    .map(|ts| ts.iter().all(|t| *t <= cutoff))
                    .unwrap_or(false);

                if stale {
                    match self.store().delete(key).await {
                        Ok(()) => stats.removed += 1,
                        Err(e) => {
                            stats.failed += 1;
                            tracing::debug!(key = %key, error = %e, "Failed to delete stale window");
                        }
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        stats
    }
}

/// Window length for a `{prefix}window:{tier}:{key}` key
fn window_seconds_for(cfg: &crate::config::RateLimitConfig, prefix: &str, key: &str) -> Option<i64> {
    let rest = key.strip_prefix(prefix)?.strip_prefix("window:")?;
    let (tier, _) = rest.split_once(':')?;
    let limit = match Tier::parse(tier)? {
        Tier::Global => cfg.global,
        Tier::Ip => cfg.ip,
        Tier::Reporter => cfg.reporter,
        Tier::App => cfg.app,
    }?;
    limit.is_active().then_some(limit.window_seconds)
}
