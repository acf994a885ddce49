pub mod health;
pub mod ingest;
pub mod metrics_handler;
