use crate::pipeline::Pipeline;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;
use std::sync::Arc;

/// Health check endpoint
///
/// Reports 503 once shutdown has started so load balancers stop routing here.
pub async fn health_check(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    let (status, label) = if pipeline.is_accepting() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    };

    (
        status,
        Json(json!({
            "status": label,
            "instance_id": pipeline.instance_id(),
            "version": env!("CARGO_PKG_VERSION"),
            "buffered": pipeline.queue().len() + pipeline.reporter().buffered(),
            "pending_retries": pipeline.reporter().pending_retries(),
        })),
    )
}
