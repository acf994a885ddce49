use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Application error types surfaced on the HTTP path
#[derive(Debug)]
pub enum AppError {
    /// Malformed ingestion payload
    InvalidPayload(String),
    /// Pipeline is shutting down and no longer accepts records
    ShuttingDown,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPayload(msg) => write!(f, "Invalid payload: {}", msg),
            Self::ShuttingDown => write!(f, "Service is shutting down"),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type_name(&self),
            }
        }));

        (status, body).into_response()
    }
}

fn error_type_name(error: &AppError) -> &'static str {
    match error {
        AppError::InvalidPayload(_) => "invalid_payload",
        AppError::ShuttingDown => "shutting_down",
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(format!("JSON error: {}", err))
    }
}

/// Failure delivering a batch to a sink
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("endpoint responded with {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<DeliveryError> },
}

impl DeliveryError {
    /// Short label used as a metric/log dimension
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http_status",
            Self::Request(_) => "request",
            Self::Timeout(_) => "timeout",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Exhausted { .. } => "exhausted",
        }
    }
}

/// Key-value store failure
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored value could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AppError::InvalidPayload("missing logs".to_string());
        assert_eq!(error.to_string(), "Invalid payload: missing logs");
    }

    #[test]
    fn test_error_type_name() {
        assert_eq!(error_type_name(&AppError::ShuttingDown), "shutting_down");
        assert_eq!(
            error_type_name(&AppError::InvalidPayload("x".to_string())),
            "invalid_payload"
        );
    }

    #[tokio::test]
    async fn test_error_response() {
        let response = AppError::InvalidPayload("bad".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::ShuttingDown.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_exhausted_wraps_last_error() {
        let err = DeliveryError::Exhausted {
            attempts: 4,
            last: Box::new(DeliveryError::Http {
                status: 503,
                body: "unavailable".to_string(),
            }),
        };
        assert_eq!(err.kind(), "exhausted");
        assert!(err.to_string().contains("after 4 attempts"));
        assert!(err.to_string().contains("503"));
    }
}
