//! Header names shared by ingestion, admission control and HTTP delivery

/// Reporter instance id (loop prevention)
pub const REPORTER_ID: &str = "x-logrelay-reporter-id";
/// Marks a batch that already passed through a relay
pub const PROCESSED: &str = "x-logrelay-processed";
/// Source application name
pub const SOURCE: &str = "x-logrelay-source";

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";

pub const RATE_LIMIT_LIMIT: &str = "x-rate-limit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-rate-limit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-rate-limit-reset";
pub const RATE_LIMIT_RETRY_AFTER: &str = "x-rate-limit-retry-after";
pub const ACTION: &str = "x-logrelay-action";
pub const RATE_LIMIT_TIER: &str = "x-logrelay-rate-limit-tier";

/// Client address headers, in order of preference
pub const FORWARDED_FOR: &str = "x-forwarded-for";
pub const REAL_IP: &str = "x-real-ip";
pub const CF_CONNECTING_IP: &str = "cf-connecting-ip";
