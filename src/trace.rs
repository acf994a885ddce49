//! W3C trace context helpers
//!
//! Ids are generated from v4 UUIDs and always rendered as lowercase hex.

use crate::record::TraceContext;
use uuid::Uuid;

/// Sampled flag used for every traceparent we emit
pub const DEFAULT_FLAGS: &str = "01";

/// Generate a 32-hex trace id
pub fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a 16-hex span id
pub fn generate_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Fresh root context
pub fn new_context() -> TraceContext {
    TraceContext {
        trace_id: generate_trace_id(),
        span_id: generate_span_id(),
        parent_id: None,
    }
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// 32 lowercase hex characters, not all zero
pub fn is_valid_trace_id(id: &str) -> bool {
    is_lower_hex(id, 32) && id.bytes().any(|b| b != b'0')
}

/// 16 lowercase hex characters, not all zero
pub fn is_valid_span_id(id: &str) -> bool {
    is_lower_hex(id, 16) && id.bytes().any(|b| b != b'0')
}

/// Whether every id in the context is well formed
pub fn is_valid_context(ctx: &TraceContext) -> bool {
    is_valid_trace_id(&ctx.trace_id)
        && is_valid_span_id(&ctx.span_id)
        && ctx.parent_id.as_deref().map_or(true, is_valid_span_id)
}

/// Render `00-<trace-id>-<span-id>-<flags>`
pub fn format_traceparent(ctx: &TraceContext) -> String {
    format!("00-{}-{}-{}", ctx.trace_id, ctx.span_id, DEFAULT_FLAGS)
}

/// Parse a traceparent header into (trace id, parent span id, flags)
pub fn parse_traceparent(header: &str) -> Option<(String, String, String)> {
    let mut parts = header.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;

    if parts.next().is_some() || version != "00" || !is_lower_hex(flags, 2) {
        return None;
    }
    if !is_valid_trace_id(trace_id) || !is_valid_span_id(span_id) {
        return None;
    }

    Some((trace_id.to_string(), span_id.to_string(), flags.to_string()))
}

/// Child context continuing an inbound traceparent
pub fn child_of(traceparent: &str) -> Option<TraceContext> {
    let (trace_id, parent_id, _) = parse_traceparent(traceparent)?;
    Some(TraceContext {
        trace_id,
        span_id: generate_span_id(),
        parent_id: Some(parent_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_valid() {
        let ctx = new_context();
        assert!(is_valid_trace_id(&ctx.trace_id));
        assert!(is_valid_span_id(&ctx.span_id));
        assert!(is_valid_context(&ctx));
    }

    #[test]
    fn test_rejects_malformed_ids() {
        assert!(!is_valid_trace_id("4BF92F3577B34DA6A3CE929D0E0E4736"));
        assert!(!is_valid_trace_id("00000000000000000000000000000000"));
        assert!(!is_valid_span_id("00f067aa0ba902b"));
        assert!(!is_valid_span_id("00f067aa0ba902bz"));
    }

    #[test]
    fn test_traceparent_round_trip() {
        let ctx = TraceContext {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            parent_id: None,
        };
        let header = format_traceparent(&ctx);
        assert_eq!(header, "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01");

        let child = child_of(&header).unwrap();
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_eq!(child.parent_id.as_deref(), Some("00f067aa0ba902b7"));
        assert_ne!(child.span_id, ctx.span_id);
    }

    #[test]
    fn test_parse_traceparent_rejects_bad_version() {
        assert!(parse_traceparent("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").is_none());
        assert!(parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7").is_none());
    }
}
