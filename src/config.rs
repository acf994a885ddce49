use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub file: FileSinkConfig,
    #[serde(default)]
    pub http: HttpSinkConfig,
    #[serde(default)]
    pub console: ConsoleSinkConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Path of the ingestion endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            endpoint: default_endpoint(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_app_version")]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

/// Limit for a single rate-limiting tier
///
/// A non-positive limit or window disables the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TierLimit {
    pub limit: i64,
    pub window_seconds: i64,
}

impl TierLimit {
    pub fn is_active(&self) -> bool {
        self.limit > 0 && self.window_seconds > 0
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Admit requests when the store is unreachable
    #[serde(default = "default_true")]
    pub fail_open: bool,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_cleanup_chunk")]
    pub cleanup_chunk_size: usize,
    /// Take the client address from `x-forwarded-for`, `x-real-ip` and
    /// `cf-connecting-ip`; only enable behind a proxy that sets them
    #[serde(default)]
    pub trust_proxy_headers: bool,
    #[serde(default)]
    pub global: Option<TierLimit>,
    #[serde(default)]
    pub ip: Option<TierLimit>,
    #[serde(default)]
    pub reporter: Option<TierLimit>,
    #[serde(default)]
    pub app: Option<TierLimit>,
    #[serde(default)]
    pub blocking: BlockingConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_open: true,
            key_prefix: default_key_prefix(),
            cleanup_interval_secs: default_cleanup_interval(),
            cleanup_chunk_size: default_cleanup_chunk(),
            trust_proxy_headers: false,
            global: Some(TierLimit {
                limit: 10_000,
                window_seconds: 60,
            }),
            ip: Some(TierLimit {
                limit: 300,
                window_seconds: 60,
            }),
            reporter: None,
            app: None,
            blocking: BlockingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Repeat violations within this many hours escalate the block level
    #[serde(default = "default_escalation_reset_hours")]
    pub escalation_reset_hours: u64,
    /// Block duration per escalation level, in seconds
    #[serde(default = "default_block_timeouts")]
    pub timeouts: Vec<u64>,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            escalation_reset_hours: default_escalation_reset_hours(),
            timeouts: default_block_timeouts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_batch_size: default_max_batch_size(),
            max_batch_age_ms: default_max_batch_age_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
    #[serde(default = "default_batch_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default = "default_sorting_window_ms")]
    pub sorting_window_ms: u64,
    #[serde(default = "default_true")]
    pub retry_on_failure: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Only these levels are buffered when set
    #[serde(default)]
    pub levels: Option<Vec<i32>>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            max_age_ms: default_batch_max_age_ms(),
            sorting_window_ms: default_sorting_window_ms(),
            retry_on_failure: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            levels: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSinkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_directory")]
    pub directory: String,
    /// Supports `{YYYY}`, `{MM}`, `{DD}` and `{HH}` tokens
    #[serde(default = "default_file_name_format")]
    pub file_name_format: String,
    #[serde(default = "default_file_max_size")]
    pub max_size_bytes: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_buffer_max_size")]
    pub buffer_max_size_bytes: usize,
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
    /// Static fields merged into every written line
    #[serde(default)]
    pub additional_fields: serde_json::Map<String, serde_json::Value>,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_log_directory(),
            file_name_format: default_file_name_format(),
            max_size_bytes: default_file_max_size(),
            flush_interval_ms: default_flush_interval_ms(),
            buffer_max_size_bytes: default_buffer_max_size(),
            max_write_retries: default_max_write_retries(),
            additional_fields: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpSinkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Extra static headers sent with every delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            timeout_ms: default_http_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsoleSinkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pretty: bool,
}

impl Default for ConsoleSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_endpoint() -> String {
    "/api/logs".to_string()
}
fn default_body_limit() -> usize {
    2 * 1024 * 1024
}
fn default_app_name() -> String {
    "logrelay".to_string()
}
fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_key_prefix() -> String {
    "ratelimit".to_string()
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_cleanup_chunk() -> usize {
    100
}
fn default_escalation_reset_hours() -> u64 {
    24
}
fn default_block_timeouts() -> Vec<u64> {
    vec![60, 300, 1800]
}
fn default_max_queue_size() -> usize {
    1000
}
fn default_max_batch_size() -> usize {
    50
}
fn default_max_batch_age_ms() -> u64 {
    1000
}
fn default_batch_max_size() -> usize {
    100
}
fn default_batch_max_age_ms() -> u64 {
    5000
}
fn default_sorting_window_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_log_directory() -> String {
    "./logs".to_string()
}
fn default_file_name_format() -> String {
    "logrelay-{YYYY}-{MM}-{DD}.log".to_string()
}
fn default_file_max_size() -> u64 {
    50 * 1024 * 1024
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_buffer_max_size() -> usize {
    64 * 1024
}
fn default_max_write_retries() -> u32 {
    5
}
fn default_http_timeout_ms() -> u64 {
    5000
}

/// Load configuration from a TOML file merged with `LOGRELAY__*` environment variables
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(config::Environment::with_prefix("LOGRELAY").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if !cfg.server.endpoint.starts_with('/') {
        anyhow::bail!("server.endpoint must start with '/'");
    }

    let blocking = &cfg.rate_limit.blocking;
    if cfg.rate_limit.enabled && blocking.enabled && blocking.timeouts.is_empty() {
        anyhow::bail!("rate_limit.blocking.timeouts must not be empty when blocking is enabled");
    }

    if cfg.queue.max_queue_size == 0 {
        anyhow::bail!("queue.max_queue_size must be greater than zero");
    }
    if cfg.queue.max_batch_size > cfg.queue.max_queue_size {
        anyhow::bail!(
            "queue.max_batch_size ({}) cannot exceed queue.max_queue_size ({})",
            cfg.queue.max_batch_size,
            cfg.queue.max_queue_size
        );
    }

    if cfg.batch.max_size == 0 {
        anyhow::bail!("batch.max_size must be greater than zero");
    }

    if cfg.file.enabled && cfg.file.directory.trim().is_empty() {
        anyhow::bail!("file.directory is required when the file sink is enabled");
    }

    if cfg.http.enabled {
        if cfg.http.endpoint.is_empty() {
            anyhow::bail!("http.endpoint is required when the HTTP sink is enabled");
        }
        if points_at_self(cfg) {
            anyhow::bail!(
                "http.endpoint '{}' targets this server's own ingest endpoint",
                cfg.http.endpoint
            );
        }
    }

    Ok(())
}

/// Whether the HTTP sink would deliver back into our own ingest endpoint
fn points_at_self(cfg: &Config) -> bool {
    let Ok(url) = reqwest::Url::parse(&cfg.http.endpoint) else {
        return false;
    };

    let local_host = matches!(
        url.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("::1") | Some("[::1]")
    ) || url.host_str() == Some(cfg.server.host.as_str());

    local_host
        && url.port_or_known_default() == Some(cfg.server.port)
        && url.path() == cfg.server.endpoint
}
