//! Graceful shutdown
//!
//! Translates process signals into the cancellation tokens the transport
//! engines and tools already run on, and reports which signal ended the
//! process so operators can tell an interactive Ctrl+C from a service
//! manager's SIGTERM in the logs.

use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Which signal requested the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C / SIGINT
    Interrupt,
    /// SIGTERM, typically from a service manager or container runtime
    Terminate,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt"),
            ShutdownReason::Terminate => write!(f, "terminate"),
        }
    }
}

/// Wait for a shutdown signal and report which one fired.
///
/// A subscriber CLI can block on this directly next to its measurement
/// loop; long-running publishers should prefer [`cancel_on_shutdown`] so
/// every connection task unwinds through its cancellation token.
pub async fn wait_for_shutdown() -> ShutdownReason {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("no SIGTERM handler ({}), falling back to Ctrl+C only", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupt,
            _ = recv_terminate(&mut term) => ShutdownReason::Terminate,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ShutdownReason::Interrupt
    }
}

#[cfg(unix)]
async fn recv_terminate(term: &mut Option<tokio::signal::unix::Signal>) {
    match term {
        Some(sig) => {
            sig.recv().await;
        }
        // Without a SIGTERM handler only Ctrl+C can resolve the select
        None => std::future::pending().await,
    }
}

/// Cancel `token` once a shutdown signal arrives.
///
/// The token is expected to be the root of an engine's cancellation tree;
/// cancelling it cascades to every per-connection task.
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        let reason = wait_for_shutdown().await;
        tracing::info!("{} signal received, shutting down", reason);
        token.cancel();
    });
}
