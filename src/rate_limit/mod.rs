//! Admission control for the ingestion endpoint
//!
//! Sliding-window counters are kept per tier (global, ip, reporter, app) in a
//! shared [`KeyValueStore`](crate::store::KeyValueStore), together with an
//! escalating IP-block ledger. Counting is best-effort: concurrent requests on
//! the same key may race on read-modify-write.

pub mod cleanup;
pub mod identifier;
pub mod limiter;
pub mod middleware;
pub mod response;

pub use cleanup::{spawn_cleanup_task, CleanupStats};
pub use identifier::{HeaderLookup, Identifier, UNKNOWN_IP};
pub use limiter::RateLimiter;
pub use middleware::rate_limit_middleware;
pub use response::rejection_response;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rate-limiting dimension, evaluated in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Global,
    Ip,
    Reporter,
    App,
}

impl Tier {
    pub const ORDER: [Tier; 4] = [Tier::Global, Tier::Ip, Tier::Reporter, Tier::App];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Global => "global",
            Tier::Ip => "ip",
            Tier::Reporter => "reporter",
            Tier::App => "app",
        }
    }

    pub fn parse(value: &str) -> Option<Tier> {
        Tier::ORDER.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a rejected client is told to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Drop requests until the block expires
    Block,
    /// The whole service is saturated
    Pause,
    /// Slow down and retry after the advertised delay
    Backoff,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Block => "block",
            Action::Pause => "pause",
            Action::Backoff => "backoff",
        }
    }
}

/// Escalating block held against an IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpBlockRecord {
    pub ip: String,
    pub level: usize,
    pub expires_at: i64,
    pub violations: u32,
    pub last_violation: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub level: usize,
    pub expires_at: i64,
}

/// Outcome of evaluating one tier (or the block ledger)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub allowed: bool,
    pub tier: Tier,
    pub limit: i64,
    pub current: i64,
    pub remaining: i64,
    /// Unix milliseconds at which the window frees a slot
    pub reset_time: i64,
    /// Seconds until a retry can succeed
    pub retry_after: i64,
    pub is_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_info: Option<BlockInfo>,
}

impl CheckResult {
    pub(crate) fn blocked(record: &IpBlockRecord, limit: i64, now: i64) -> Self {
        Self {
            allowed: false,
            tier: Tier::Ip,
            limit,
            current: limit,
            remaining: 0,
            reset_time: record.expires_at,
            retry_after: retry_after_secs(record.expires_at, now),
            is_blocked: true,
            block_info: Some(BlockInfo {
                level: record.level,
                expires_at: record.expires_at,
            }),
        }
    }

    pub fn action(&self) -> Action {
        if self.is_blocked {
            Action::Block
        } else if self.tier == Tier::Global {
            Action::Pause
        } else {
            Action::Backoff
        }
    }

    pub fn error_code(&self) -> &'static str {
        if self.is_blocked {
            "IP_BLOCKED"
        } else {
            "RATE_LIMIT_EXCEEDED"
        }
    }
}

/// `ceil((reset - now) / 1000)`, never negative
pub(crate) fn retry_after_secs(reset_time: i64, now: i64) -> i64 {
    let delta = (reset_time - now).max(0);
    (delta + 999) / 1000
}

/// The rejecting result, if any
pub fn first_rejection(results: &[CheckResult]) -> Option<&CheckResult> {
    results.iter().find(|r| !r.allowed)
}

/// The allowed result closest to its limit (used for informational headers)
pub fn tightest(results: &[CheckResult]) -> Option<&CheckResult> {
    results.iter().filter(|r| r.allowed).min_by_key(|r| r.remaining)
}
