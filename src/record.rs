//! Log record and batch types shared by every stage of the pipeline
//!
//! Field names follow the ingestion wire format (camelCase JSON).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Numeric log levels (pino-compatible)
pub mod level {
    pub const TRACE: i32 = 10;
    pub const DEBUG: i32 = 20;
    pub const INFO: i32 = 30;
    pub const WARN: i32 = 40;
    pub const ERROR: i32 = 50;
    pub const FATAL: i32 = 60;

    /// Human readable label for a numeric level
    pub fn label(level: i32) -> &'static str {
        match level {
            l if l >= FATAL => "FATAL",
            l if l >= ERROR => "ERROR",
            l if l >= WARN => "WARN",
            l if l >= INFO => "INFO",
            l if l >= DEBUG => "DEBUG",
            _ => "TRACE",
        }
    }
}

/// Trace correlation attached to every record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    /// 32 lowercase hex characters
    pub trace_id: String,
    /// 16 lowercase hex characters
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// A single log/trace event
///
/// Records are never mutated after creation; stages move or clone them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unix milliseconds
    pub time: i64,
    pub level: i32,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub trace: TraceContext,
}

impl LogRecord {
    pub fn new(time: i64, level: i32, message: impl Into<String>, trace: TraceContext) -> Self {
        Self {
            time,
            level,
            message: message.into(),
            context: Map::new(),
            trace,
        }
    }

    /// Attach a context field (builder style, used before the record is handed off)
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Producing application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AppInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Relay metadata added when a batch leaves this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMeta {
    pub processed: bool,
    /// Reporter instance ids this batch has passed through, oldest first
    #[serde(default)]
    pub process_chain: Vec<String>,
    pub source: String,
    pub time: i64,
}

/// Wire body for the ingestion endpoint and for outbound HTTP delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    pub logs: Vec<LogRecord>,
    pub app: AppInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BatchMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> TraceContext {
        TraceContext {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            parent_id: None,
        }
    }

    #[test]
    fn test_record_wire_format() {
        let record = LogRecord::new(1_700_000_000_000, level::INFO, "hello", trace())
            .with_context("userId", 42)
            .with_context("path", "/checkout");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["time"], 1_700_000_000_000i64);
        assert_eq!(json["trace"]["traceId"], "4bf92f3577b34da6a3ce929d0e0e4736");
        assert!(json["trace"].get("parentId").is_none());

        // Context keeps insertion order
        let keys: Vec<&String> = record.context.keys().collect();
        assert_eq!(keys, vec!["userId", "path"]);
    }

    #[test]
    fn test_batch_without_meta_parses() {
        let body = serde_json::json!({
            "logs": [{
                "time": 1,
                "level": 30,
                "message": "m",
                "trace": {"traceId": "4bf92f3577b34da6a3ce929d0e0e4736", "spanId": "00f067aa0ba902b7"}
            }],
            "app": {"name": "web"}
        });

        let batch: LogBatch = serde_json::from_value(body).unwrap();
        assert_eq!(batch.logs.len(), 1);
        assert!(batch.logs[0].context.is_empty());
        assert_eq!(batch.app.version, "");
        assert!(batch.meta.is_none());
    }

    #[test]
    fn test_level_label() {
        assert_eq!(level::label(level::WARN), "WARN");
        assert_eq!(level::label(55), "ERROR");
        assert_eq!(level::label(0), "TRACE");
    }
}
