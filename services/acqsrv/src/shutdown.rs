//! Graceful shutdown signalling.
//!
//! Every background task (pollers, sink workers, the dispatcher) holds a
//! watch receiver and exits when the flag flips. Steady-state behavior is
//! unaffected; this only gives the host process a clean stop path.

use tokio::sync::watch;
use tracing::warn;

/// Create the shutdown flag shared by all background tasks.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Wait for Ctrl+C, or SIGTERM on Unix.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}; only Ctrl+C will be handled");
                None
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                match term_signal {
                    Some(mut sig) => { sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
