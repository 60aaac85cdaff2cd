//! Graceful Shutdown Handling
//!
//! This module provides utilities for handling graceful shutdown of the
//! bridge client. It supports SIGTERM and SIGINT signals and ensures the
//! connection is closed cleanly before the process exits.

use crate::connection::ConnectionManager;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Coordinates signal handling and the client's graceful shutdown
pub struct ShutdownCoordinator {
    /// How long to wait for the lifecycle loop to exit
    grace_period: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Start listening for shutdown signals (SIGTERM, SIGINT)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Stop the client and wait for its lifecycle loop to exit
    pub async fn shutdown_client(
        &self,
        manager: &Arc<ConnectionManager>,
        lifecycle: JoinHandle<()>,
    ) -> Result<()> {
        info!("Initiating graceful shutdown of connection manager");
        manager.shutdown().await;

        match timeout(self.grace_period, lifecycle).await {
            Ok(Ok(())) => {
                info!("Lifecycle loop exited cleanly");
            }
            Ok(Err(e)) if e.is_cancelled() => {
                info!("Lifecycle loop was cancelled");
            }
            Ok(Err(e)) => {
                error!("Lifecycle loop failed: {}", e);
            }
            Err(_) => {
                warn!(
                    "Lifecycle loop did not exit within {:?}",
                    self.grace_period
                );
            }
        }

        Ok(())
    }
}
