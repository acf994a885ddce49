use crate::{
    error::AppError,
    headers,
    pipeline::Pipeline,
    rate_limit::HeaderLookup,
    record::{LogBatch, LogRecord},
    trace,
};
use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode};
use std::sync::Arc;

/// Handle POST to the ingestion endpoint
///
/// Admission control runs in middleware before this handler. Batches that
/// this instance already relayed are acknowledged with 202 and dropped.
pub async fn ingest_logs(
    State(pipeline): State<Arc<Pipeline>>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if !pipeline.is_accepting() {
        return Err(AppError::ShuttingDown);
    }

    let batch: LogBatch = serde_json::from_slice(&body)?;

    if is_own_relay(&pipeline, &request_headers, &batch) {
        tracing::warn!(
            instance_id = %pipeline.instance_id(),
            records = batch.logs.len(),
            "Discarding batch relayed by this instance"
        );
        return Ok(StatusCode::ACCEPTED);
    }

    if batch.logs.is_empty() {
        return Ok(StatusCode::NO_CONTENT);
    }

    let inbound = request_headers.header(headers::TRACEPARENT).map(str::to_string);
    let records: Vec<LogRecord> = batch
        .logs
        .into_iter()
        .map(|record| repair_trace(record, inbound.as_deref()))
        .collect();

    tracing::debug!(app = %batch.app.name, records = records.len(), "Accepted log batch");
    pipeline.submit(&batch.app.name, records);

    Ok(StatusCode::NO_CONTENT)
}

fn is_own_relay(pipeline: &Pipeline, request_headers: &HeaderMap, batch: &LogBatch) -> bool {
    let processed = request_headers
        .header(headers::PROCESSED)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let from_self = request_headers.header(headers::REPORTER_ID) == Some(pipeline.instance_id());

    let in_chain = batch
        .meta
        .as_ref()
        .is_some_and(|meta| meta.process_chain.iter().any(|id| id == pipeline.instance_id()));

    (processed && from_self) || in_chain
}

/// Replace malformed trace ids; continue the inbound trace when there is one
fn repair_trace(mut record: LogRecord, traceparent: Option<&str>) -> LogRecord {
    if trace::is_valid_context(&record.trace) {
        return record;
    }
    record.trace = traceparent
        .and_then(trace::child_of)
        .unwrap_or_else(trace::new_context);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{level, TraceContext};

    fn broken() -> LogRecord {
        LogRecord::new(
            1,
            level::INFO,
            "x",
            TraceContext {
                trace_id: "not-hex".to_string(),
                span_id: "00f067aa0ba902b7".to_string(),
                parent_id: None,
            },
        )
    }

    #[test]
    fn test_repair_generates_fresh_context() {
        let repaired = repair_trace(broken(), None);
        assert!(trace::is_valid_context(&repaired.trace));
        assert!(repaired.trace.parent_id.is_none());
    }

    #[test]
    fn test_repair_continues_inbound_trace() {
        let header = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        let repaired = repair_trace(broken(), Some(header));
        assert_eq!(repaired.trace.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(repaired.trace.parent_id.as_deref(), Some("00f067aa0ba902b7"));
    }

    #[test]
    fn test_valid_trace_untouched() {
        let ctx = trace::new_context();
        let record = LogRecord::new(1, level::INFO, "x", ctx.clone());
        assert_eq!(repair_trace(record, None).trace, ctx);
    }
}
