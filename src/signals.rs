use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use crate::config::load_config;
use crate::pipeline::Pipeline;

/// Shutdown signal types
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    /// Graceful shutdown (stop accepting, drain the pipeline)
    Graceful,
}

/// Setup signal handlers for the server
///
/// Returns a broadcast sender for shutdown signals and a join handle for the signal task
///
/// Handles:
/// - SIGTERM/SIGINT: Graceful shutdown
/// - SIGHUP: Rate-limit reload from the configuration file
#[cfg(unix)]
pub fn setup_signal_handlers(
    config_path: PathBuf,
    pipeline: Arc<Pipeline>,
) -> (
    broadcast::Sender<ShutdownSignal>,
    tokio::task::JoinHandle<()>,
) {
    let (shutdown_tx, _) = broadcast::channel(16);
    let tx_clone = shutdown_tx.clone();

    let handle = tokio::spawn(async move {
        let (mut sigterm, mut sigint, mut sighup) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
            _ => {
                error!("Failed to install signal handlers");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, initiating graceful shutdown");
                    let _ = tx_clone.send(ShutdownSignal::Graceful);
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, initiating graceful shutdown");
                    let _ = tx_clone.send(ShutdownSignal::Graceful);
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading rate limits");
                    if let Err(e) = reload_config(&config_path, &pipeline) {
                        error!(error = %e, "Failed to reload configuration, keeping current limits");
                    }
                }
            }
        }
    });

    (shutdown_tx, handle)
}

/// Non-unix fallback: only Ctrl+C is supported
#[cfg(not(unix))]
pub fn setup_signal_handlers(
    _config_path: PathBuf,
    _pipeline: Arc<Pipeline>,
) -> (
    broadcast::Sender<ShutdownSignal>,
    tokio::task::JoinHandle<()>,
) {
    let (shutdown_tx, _) = broadcast::channel(16);
    let tx_clone = shutdown_tx.clone();

    let handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, initiating shutdown");
                let _ = tx_clone.send(ShutdownSignal::Graceful);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
    });

    (shutdown_tx, handle)
}

/// Load and validate the file, then swap the limiter configuration
///
/// A file that fails to load or validate leaves the running limits untouched.
pub fn reload_config(config_path: &std::path::Path, pipeline: &Pipeline) -> Result<()> {
    let new_config = load_config(config_path)?;

    info!(
        enabled = new_config.rate_limit.enabled,
        global = ?new_config.rate_limit.global,
        ip = ?new_config.rate_limit.ip,
        reporter = ?new_config.rate_limit.reporter,
        app = ?new_config.rate_limit.app,
        "New rate limits loaded"
    );

    pipeline.reload(&new_config);
    Ok(())
}
