use std::{sync::OnceLock, time::Duration};

use tokio::{signal, sync::broadcast};
use tokio_util::sync::CancellationToken;

/// Why the process is going down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT
    Signal,
    /// The connection pool kept refusing proxies and needs a restart
    PoolFailure,
}

impl ShutdownReason {
    /// Process exit code for this reason.
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownReason::Signal => 0,
            ShutdownReason::PoolFailure => 70,
        }
    }
}

/// Fans a single shutdown decision out to every subscriber.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    reason: OnceLock<ShutdownReason>,
    /// How long in-flight requests may drain once shutdown starts
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            reason: OnceLock::new(),
            drain_timeout,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Start shutting down. Only the first reason is broadcast; returns
    /// whether this call initiated the shutdown.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason).is_err() {
            tracing::warn!(?reason, "Shutdown already initiated, ignoring");
            return false;
        }

        tracing::info!(?reason, "Shutdown initiated");
        if self.shutdown_tx.send(reason).is_err() {
            tracing::debug!("No shutdown subscribers");
        }
        true
    }

    /// Wait for SIGINT, SIGTERM or the pool's fatal token, then trigger
    /// shutdown with the matching reason.
    pub async fn run_signal_handler(&self, pool_fatal: CancellationToken) -> ShutdownReason {
        tracing::info!("Signal handler started, listening for SIGTERM and SIGINT");

        let reason = tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                ShutdownReason::Signal
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                ShutdownReason::Signal
            }
            _ = pool_fatal.cancelled() => {
                tracing::error!("Connection pool reported an unrecoverable state, shutting down");
                ShutdownReason::PoolFailure
            }
        };

        self.trigger_shutdown(reason);
        reason
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        if let Some(reason) = self.reason.get() {
            return *reason;
        }

        match receiver.recv().await {
            Ok(reason) => reason,
            Err(error) => {
                if let Some(reason) = self.reason.get() {
                    return *reason;
                }
                tracing::warn!(error = %error, "Shutdown channel closed unexpectedly");
                ShutdownReason::Signal
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(error) => {
            tracing::error!(error = %error, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
