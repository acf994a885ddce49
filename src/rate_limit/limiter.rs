use super::{retry_after_secs, CheckResult, Identifier, IpBlockRecord, Tier};
use crate::clock::Clock;
use crate::config::{RateLimitConfig, TierLimit};
use crate::error::StorageError;
use crate::metrics;
use crate::store::{KeyValueStore, KeyValueStoreExt};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// A window list longer than `limit * OVERFLOW_FACTOR` is trimmed before evaluation
const OVERFLOW_FACTOR: i64 = 5;
/// Number of most recent timestamps (in multiples of the limit) kept by a trim
const RETAIN_FACTOR: i64 = 2;
/// Extra lifetime given to stored windows and blocks beyond their logical expiry
const TTL_SLACK_SECS: u64 = 60;

/// Multi-tier sliding-window rate limiter with an escalating IP-block ledger
///
/// Storage layout under `key_prefix`:
/// - `{prefix}:window:{tier}:{key}` → ascending list of request timestamps (ms)
/// - `{prefix}:block:{ip}` → active [`IpBlockRecord`]
/// - `{prefix}:history:{ip}` → last block, kept for `escalation_reset_hours`
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    config: ArcSwap<RateLimitConfig>,
    clock: Arc<dyn Clock>,
}

/// Window read during evaluation, written back once every tier admits
struct PendingWindow {
    key: String,
    timestamps: Vec<i64>,
    limit: TierLimit,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config: ArcSwap::from_pointee(config),
            clock,
        }
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config.load_full()
    }

    /// Swap limits and ladder atomically; stored windows are kept
    pub fn reload(&self, config: RateLimitConfig) {
        self.config.store(Arc::new(config));
    }

    pub(crate) fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn window_key(&self, prefix: &str, tier: Tier, key: &str) -> String {
        format!("{}:window:{}:{}", prefix, tier.as_str(), key)
    }

    fn block_key(prefix: &str, ip: &str) -> String {
        format!("{}:block:{}", prefix, ip)
    }

    fn history_key(prefix: &str, ip: &str) -> String {
        format!("{}:history:{}", prefix, ip)
    }

    /// Evaluate admission for one request
    ///
    /// Returns `None` when rate limiting is disabled. On rejection the vector
    /// holds exactly the rejecting result; on admission it holds one allowed
    /// result per evaluated tier and the request has been recorded.
    pub async fn check_rate_limit(&self, id: &Identifier) -> Option<Vec<CheckResult>> {
        let cfg = self.config.load_full();
        if !cfg.enabled {
            return None;
        }

        let now = self.clock.now_ms();
        match self.evaluate(&cfg, id, now).await {
            Ok(results) => Some(results),
            Err(e) => {
                metrics::record_storage_error("check");
                tracing::warn!(
                    error = %e,
                    ip = %id.ip,
                    fail_open = cfg.fail_open,
                    "Rate limit storage failure"
                );
                if cfg.fail_open {
                    Some(Vec::new())
                } else {
                    Some(vec![unavailable_result(now)])
                }
            }
        }
    }

    async fn evaluate(
        &self,
        cfg: &RateLimitConfig,
        id: &Identifier,
        now: i64,
    ) -> Result<Vec<CheckResult>, StorageError> {
        if cfg.blocking.enabled {
            if let Some(result) = self.check_block(cfg, &id.ip, now).await? {
                return Ok(vec![result]);
            }
        }

        let mut results = Vec::new();
        let mut pending = Vec::new();

        for (tier, key, limit) in active_tiers(cfg, id) {
            let storage_key = self.window_key(&cfg.key_prefix, tier, &key);
            let stored: Vec<i64> = self.store.get_as(&storage_key).await?.unwrap_or_default();

            let window_ms = limit.window_seconds * 1000;
            let cutoff = now - window_ms;

            let timestamps = if stored.len() as i64 > limit.limit * OVERFLOW_FACTOR {
                tracing::debug!(
                    tier = %tier,
                    key = %key,
                    stored = stored.len(),
                    "Trimming oversized rate limit window"
                );
                trim_window(stored, cutoff, (limit.limit * RETAIN_FACTOR) as usize)
            } else {
                stored.into_iter().filter(|t| *t > cutoff).collect()
            };

            let current = timestamps.len() as i64;
            let reset_time = timestamps
                .iter()
                .min()
                .map_or(now + window_ms, |oldest| oldest + window_ms);

            let result = CheckResult {
                allowed: current < limit.limit,
                tier,
                limit: limit.limit,
                current,
                remaining: (limit.limit - current).max(0),
                reset_time,
                retry_after: retry_after_secs(reset_time, now),
                is_blocked: false,
                block_info: None,
            };

            if !result.allowed {
                metrics::record_rejection(tier.as_str(), result.action().as_str());
                tracing::debug!(
                    tier = %tier,
                    key = %key,
                    current = current,
                    limit = limit.limit,
                    "Rate limit exceeded"
                );

                if cfg.blocking.enabled && tier != Tier::Global {
                    if let Err(e) = self.escalate(cfg, &id.ip, now).await {
                        metrics::record_storage_error("block");
                        tracing::warn!(error = %e, ip = %id.ip, "Failed to record IP block");
                    }
                }
                return Ok(vec![result]);
            }

            results.push(result);
            pending.push(PendingWindow {
                key: storage_key,
                timestamps,
                limit,
            });
        }

        for (window, result) in pending.into_iter().zip(results.iter_mut()) {
            let mut timestamps = window.timestamps;
            timestamps.push(now);
            let cap = (window.limit.limit * RETAIN_FACTOR).max(1) as usize;
            if timestamps.len() > cap {
                timestamps.drain(..timestamps.len() - cap);
            }

            let ttl = window.limit.window_seconds as u64 + TTL_SLACK_SECS;
            self.store.set_as(&window.key, &timestamps, Some(ttl)).await?;

            result.current += 1;
            result.remaining = (result.limit - result.current).max(0);
        }

        Ok(results)
    }

    /// Short-circuit result for an active block; expired blocks are removed
    async fn check_block(
        &self,
        cfg: &RateLimitConfig,
        ip: &str,
        now: i64,
    ) -> Result<Option<CheckResult>, StorageError> {
        let key = Self::block_key(&cfg.key_prefix, ip);
        let record: Option<IpBlockRecord> = self.store.get_as(&key).await?;
        let Some(record) = record else {
            return Ok(None);
        };

        if record.expires_at > now {
            metrics::record_rejection(Tier::Ip.as_str(), "block");
            let limit = cfg.ip.map(|l| l.limit).unwrap_or(0);
            return Ok(Some(CheckResult::blocked(&record, limit, now)));
        }

        self.store.delete(&key).await?;
        tracing::info!(ip = %ip, level = record.level, "IP block expired");
        Ok(None)
    }

    /// Record a violation for `ip` and (re)apply a block
    pub async fn block_ip(&self, ip: &str) -> Result<IpBlockRecord, StorageError> {
        let cfg = self.config.load_full();
        self.escalate(&cfg, ip, self.clock.now_ms()).await
    }

    async fn escalate(
        &self,
        cfg: &RateLimitConfig,
        ip: &str,
        now: i64,
    ) -> Result<IpBlockRecord, StorageError> {
        let block_key = Self::block_key(&cfg.key_prefix, ip);
        let history_key = Self::history_key(&cfg.key_prefix, ip);

        let active: Option<IpBlockRecord> = self.store.get_as(&block_key).await?;
        let prior = match active {
            Some(record) => Some(record),
            None => self.store.get_as(&history_key).await?,
        };

        let reset_ms = (cfg.blocking.escalation_reset_hours as i64) * 3_600_000;
        let max_level = cfg.blocking.timeouts.len().saturating_sub(1);

        let (level, violations) = match prior {
            Some(prior) if now - prior.last_violation <= reset_ms => {
                ((prior.level + 1).min(max_level), prior.violations + 1)
            }
            _ => (0, 1),
        };

        let timeout_secs = cfg.blocking.timeouts.get(level).copied().unwrap_or(60);
        let record = IpBlockRecord {
            ip: ip.to_string(),
            level,
            expires_at: now + (timeout_secs as i64) * 1000,
            violations,
            last_violation: now,
        };

        self.store
            .set_as(&block_key, &record, Some(timeout_secs + TTL_SLACK_SECS))
            .await?;
        self.store
            .set_as(
                &history_key,
                &record,
                Some(cfg.blocking.escalation_reset_hours * 3600 + timeout_secs),
            )
            .await?;

        metrics::record_ip_block(level);
        tracing::warn!(
            ip = %ip,
            level = level,
            violations = violations,
            block_seconds = timeout_secs,
            "IP blocked"
        );

        Ok(record)
    }

    /// Active block for `ip`, if any
    pub async fn get_block(&self, ip: &str) -> Result<Option<IpBlockRecord>, StorageError> {
        let key = Self::block_key(&self.config.load().key_prefix, ip);
        self.store.get_as(&key).await
    }
}

/// Tiers that apply to `id`, in evaluation order
fn active_tiers(cfg: &RateLimitConfig, id: &Identifier) -> Vec<(Tier, String, TierLimit)> {
    let candidates = [
        (Tier::Global, cfg.global, Some("all".to_string())),
        (Tier::Ip, cfg.ip, Some(id.ip.clone())),
        (Tier::Reporter, cfg.reporter, id.reporter_id.clone()),
        (Tier::App, cfg.app, id.app_name.clone()),
    ];

    candidates
        .into_iter()
        .filter_map(|(tier, limit, key)| {
            let limit = limit.filter(TierLimit::is_active)?;
            Some((tier, key?, limit))
        })
        .collect()
}

/// Keep at most `keep` of the most recent timestamps inside the window
fn trim_window(mut timestamps: Vec<i64>, cutoff: i64, keep: usize) -> Vec<i64> {
    timestamps.retain(|t| *t > cutoff);
    timestamps.sort_unstable();
    if timestamps.len() > keep {
        timestamps.drain(..timestamps.len() - keep);
    }
    timestamps
}

/// Rejection used when the store is down and the deployment fails closed
fn unavailable_result(now: i64) -> CheckResult {
    CheckResult {
        allowed: false,
        tier: Tier::Global,
        limit: 0,
        current: 0,
        remaining: 0,
        reset_time: now + 1000,
        retry_after: 1,
        is_blocked: false,
        block_info: None,
    }
}
