use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    handlers, metrics,
    pipeline::Pipeline,
    rate_limit::rate_limit_middleware,
    signals::setup_signal_handlers,
};

/// Start the relay server
///
/// This function:
/// 1. Initializes metrics
/// 2. Builds and starts the log pipeline
/// 3. Sets up signal handlers for graceful shutdown and rate-limit reload
/// 4. Serves requests until shutdown, then drains the pipeline
pub async fn start_server(config: Config, config_path: PathBuf) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics());

    let pipeline = Arc::new(Pipeline::create(&config)?);
    pipeline.start();

    let (shutdown_tx, signal_handle) = setup_signal_handlers(config_path, pipeline.clone());
    let mut shutdown_rx = shutdown_tx.subscribe();

    let app = create_router(&config, pipeline.clone(), metrics_handle);

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    info!(
        address = %addr,
        endpoint = %config.server.endpoint,
        instance_id = %pipeline.instance_id(),
        "Starting logrelay"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
        info!("Shutdown signal received, draining connections...");
    })
    .await?;

    pipeline.shutdown().await;

    signal_handle.abort();
    info!("Server stopped gracefully");

    Ok(())
}

/// Create the Axum router with all routes and middleware
pub fn create_router(
    config: &Config,
    pipeline: Arc<Pipeline>,
    metrics_handle: Arc<PrometheusHandle>,
) -> Router {
    let ingest_routes = Router::new()
        .route(&config.server.endpoint, post(handlers::ingest::ingest_logs))
        .layer(middleware::from_fn_with_state(
            pipeline.limiter().clone(),
            rate_limit_middleware,
        ))
        .route("/health", get(handlers::health::health_check))
        .with_state(pipeline);

    Router::new()
        .route("/metrics", get(handlers::metrics_handler::render_metrics))
        .with_state(metrics_handle)
        .merge(ingest_routes)
        .layer(DefaultBodyLimit::max(config.server.body_limit_bytes))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TierLimit;
    use crate::store::MemoryStore;
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    fn app(config: &Config) -> (Router, Arc<Pipeline>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let pipeline = Arc::new(Pipeline::from_parts(
            config,
            "relay-test".to_string(),
            Vec::new(),
            Arc::new(MemoryStore::with_clock(clock.clone())),
            clock,
        ));
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let router = create_router(config, pipeline.clone(), Arc::new(recorder.handle()));
        (router, pipeline)
    }

    fn ingest(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/logs")
            .header("content-type", "application/json")
            .header("x-real-ip", "203.0.113.5")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes_exist() {
        let (router, _) = app(&Config::default());

        let response = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_is_not_rate_limited() {
        let mut config = Config::default();
        config.rate_limit.global = Some(TierLimit { limit: 1, window_seconds: 60 });
        let (router, _) = app(&config);

        for _ in 0..3 {
            let response = router
                .clone()
                .oneshot(Request::get("/health").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (router, _) = app(&Config::default());
        let response = router.oneshot(ingest("{\"logs\": 5}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let mut config = Config::default();
        config.server.body_limit_bytes = 16;
        let (router, _) = app(&config);

        let response = router
            .oneshot(ingest(r#"{"logs": [], "app": {"name": "a-long-application-name"}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
