use anyhow::{bail, Result};
use colored::Colorize;
use logrelay::{
    config,
    queue::LogQueue,
    record::{level, AppInfo, LogRecord},
    sinks::HttpSink,
    trace,
};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Execute the send command
///
/// Pushes one record through the client queue and HTTP sink, exactly the way
/// an embedding application would.
pub async fn execute(
    config_path: &Path,
    message: String,
    level: i32,
    endpoint: Option<String>,
) -> Result<()> {
    let cfg = config::load_config(config_path)?;

    let mut http = cfg.http.clone();
    http.endpoint = target_endpoint(&cfg, endpoint);

    let app = AppInfo {
        name: cfg.app.name.clone(),
        version: cfg.app.version.clone(),
    };
    let sink = Arc::new(HttpSink::new(http.clone(), app, Uuid::new_v4().to_string())?);
    let queue = LogQueue::client(cfg.queue.clone(), sink);

    let record = LogRecord::new(
        chrono::Utc::now().timestamp_millis(),
        level,
        message,
        trace::new_context(),
    );
    let trace_id = record.trace.trace_id.clone();

    queue.enqueue(record);
    queue.drain().await;

    if !queue.is_empty() {
        bail!("Failed to deliver log record to {}", http.endpoint);
    }

    println!(
        "{} {} record sent to {} (trace {})",
        "✓".green(),
        level::label(level),
        http.endpoint,
        trace_id.dimmed()
    );
    Ok(())
}

/// Explicit flag, then the configured HTTP sink, then this host's own server
fn target_endpoint(cfg: &config::Config, explicit: Option<String>) -> String {
    explicit
        .filter(|e| !e.is_empty())
        .or_else(|| Some(cfg.http.endpoint.clone()).filter(|e| !e.is_empty()))
        .unwrap_or_else(|| {
            let host = match cfg.server.host.as_str() {
                "0.0.0.0" | "::" => "127.0.0.1",
                other => other,
            };
            format!("http://{}:{}{}", host, cfg.server.port, cfg.server.endpoint)
        })
}
