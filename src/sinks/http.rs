use crate::clock::current_millis;
use crate::config::HttpSinkConfig;
use crate::error::DeliveryError;
use crate::headers;
use crate::record::{AppInfo, BatchMeta, LogBatch, LogRecord};
use crate::reporter::{RetryPolicy, Sink};
use crate::trace::format_traceparent;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Posts batches to a remote ingestion endpoint
///
/// Every request carries the loop-prevention headers and a `traceparent`
/// taken from the first record. As a [`Sink`] each call is one POST and the
/// batch reporter owns retries; [`deliver`](Self::deliver) retries on its own
/// for callers without a reporter.
pub struct HttpSink {
    client: reqwest::Client,
    config: HttpSinkConfig,
    app: AppInfo,
    instance_id: String,
    policy: RetryPolicy,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig, app: AppInfo, instance_id: impl Into<String>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().build()?;
        let policy = RetryPolicy::new(config.max_retries, Duration::from_millis(config.retry_delay_ms));
        let timeout = Duration::from_millis(config.timeout_ms);

        Ok(Self {
            client,
            config,
            app,
            instance_id: instance_id.into(),
            policy,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn batch(&self, records: &[LogRecord]) -> LogBatch {
        LogBatch {
            logs: records.to_vec(),
            app: self.app.clone(),
            meta: Some(BatchMeta {
                processed: true,
                process_chain: vec![self.instance_id.clone()],
                source: self.app.name.clone(),
                time: current_millis(),
            }),
        }
    }

    fn request(&self, batch: &LogBatch) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header(headers::REPORTER_ID, &self.instance_id)
            .header(headers::PROCESSED, "true")
            .header(headers::SOURCE, &self.app.name);

        if let Some(first) = batch.logs.first() {
            request = request.header(headers::TRACEPARENT, format_traceparent(&first.trace));
            if let Some(state) = first.context.get("tracestate").and_then(|v| v.as_str()) {
                request = request.header(headers::TRACESTATE, state);
            }
        }

        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        request.json(batch)
    }

    async fn send_once(&self, batch: &LogBatch) -> Result<(), DeliveryError> {
        let response = tokio::time::timeout(self.timeout, self.request(batch).send())
            .await
            .map_err(|_| DeliveryError::Timeout(self.timeout))??;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Http {
            status: status.as_u16(),
            body,
        })
    }

    /// Post `records` as one batch, once
    pub async fn post(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
        if records.is_empty() {
            return Ok(());
        }
        self.send_once(&self.batch(records)).await?;
        tracing::debug!(endpoint = %self.config.endpoint, records = records.len(), "Batch posted");
        Ok(())
    }

    /// Post `records` as one batch, retrying with backoff
    pub async fn deliver(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
        if records.is_empty() {
            return Ok(());
        }

        let batch = self.batch(records);
        let mut attempt = 0;

        loop {
            let error = match self.send_once(&batch).await {
                Ok(()) => {
                    tracing::debug!(
                        endpoint = %self.config.endpoint,
                        records = records.len(),
                        attempt = attempt,
                        "Batch posted"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            let Some(delay) = self.policy.next_delay(attempt) else {
                tracing::error!(
                    endpoint = %self.config.endpoint,
                    attempts = attempt + 1,
                    error = %error,
                    "HTTP delivery exhausted"
                );
                return Err(DeliveryError::Exhausted {
                    attempts: attempt + 1,
                    last: Box::new(error),
                });
            };

            tracing::warn!(
                endpoint = %self.config.endpoint,
                attempt = attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "HTTP delivery failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn log_batch(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
        self.post(records).await
    }
}

/// [`HttpSink`] that retries inside every call, for the client queue
pub struct RetryingHttpSink {
    sink: Arc<HttpSink>,
}

impl RetryingHttpSink {
    pub fn new(sink: Arc<HttpSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Sink for RetryingHttpSink {
    fn name(&self) -> &str {
        self.sink.name()
    }

    async fn log_batch(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
        self.sink.deliver(records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::BatchConfig;
    use crate::record::{level, TraceContext};
    use crate::reporter::BatchReporter;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: String) -> HttpSinkConfig {
        HttpSinkConfig {
            enabled: true,
            endpoint,
            timeout_ms: 500,
            max_retries: 2,
            retry_delay_ms: 10,
            ..HttpSinkConfig::default()
        }
    }

    fn sink(endpoint: String) -> HttpSink {
        let app = AppInfo {
            name: "checkout".to_string(),
            version: "1.2.0".to_string(),
        };
        HttpSink::new(config(endpoint), app, "relay-1").unwrap()
    }

    fn record(message: &str) -> LogRecord {
        LogRecord::new(
            1_700_000_000_000,
            level::INFO,
            message,
            TraceContext {
                trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
                span_id: "00f067aa0ba902b7".to_string(),
                parent_id: None,
            },
        )
    }

    #[tokio::test]
    async fn test_posts_batch_with_loop_prevention_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(header("x-logrelay-reporter-id", "relay-1"))
            .and(header("x-logrelay-processed", "true"))
            .and(header("x-logrelay-source", "checkout"))
            .and(header(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = sink(format!("{}/ingest", server.uri()));
        sink.log_batch(&[record("a"), record("b")]).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: LogBatch = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.logs.len(), 2);
        assert_eq!(body.app.name, "checkout");
        let meta = body.meta.unwrap();
        assert!(meta.processed);
        assert_eq!(meta.process_chain, vec!["relay-1".to_string()]);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sink = sink(server.uri());
        sink.deliver(&[record("a")]).await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3)
            .mount(&server)
            .await;

        let sink = sink(server.uri());
        let err = sink.deliver(&[record("a")]).await.unwrap_err();
        match err {
            DeliveryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, DeliveryError::Http { status: 500, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_aborts_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.timeout_ms = 50;
        let sink = HttpSink::new(cfg, AppInfo::default(), "relay-1").unwrap();

        let err = sink.log_batch(&[record("a")]).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_sent() {
        let server = MockServer::start().await;
        let sink = sink(server.uri());
        sink.log_batch(&[]).await.unwrap();
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_call_is_a_single_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let sink = sink(server.uri());
        let err = sink.log_batch(&[record("a")]).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Http { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_retrying_adapter_uses_sink_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let retrying = RetryingHttpSink::new(Arc::new(sink(server.uri())));
        assert_eq!(retrying.name(), "http");
        let err = retrying.log_batch(&[record("a")]).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_reporter_attempts_match_posts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.max_retries = 3;
        let http: Arc<dyn Sink> = Arc::new(HttpSink::new(cfg, AppInfo::default(), "relay-1").unwrap());
        let reporter = BatchReporter::new(
            BatchConfig {
                max_retries: 3,
                retry_delay_ms: 10,
                ..BatchConfig::default()
            },
            vec![http],
            Arc::new(SystemClock::new()),
        );
        let mut failures = reporter.failures();

        reporter.enqueue(vec![record("a")]);
        reporter.force_flush().await;

        let failure = tokio::time::timeout(Duration::from_secs(10), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.sink, "http");
        assert_eq!(failure.attempts, 4);
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }
}
