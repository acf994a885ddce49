use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Handle /metrics endpoint in the Prometheus text format
pub async fn render_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_handler() {
        // Local recorder; the global one is only installed by the server
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = Arc::new(recorder.handle());

        metrics::with_local_recorder(&recorder, || {
            crate::metrics::record_ip_block(0);
        });

        let response = render_metrics(State(handle)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("logrelay_ip_blocks_total{level=\"0\"} 1"));
    }
}
