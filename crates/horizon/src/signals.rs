//! Signal handling for graceful server shutdown.
//!
//! The chat server runs until the operator asks it to stop. This module turns
//! the platform's termination signals into a single future the main task can
//! wait on before calling [`NetServer::shutdown`](horizon_net::NetServer::shutdown).

use anyhow::Result;
use tokio::signal;
use tracing::info;

/// Waits for a termination signal.
///
/// Returns as soon as the first signal arrives; the caller decides how to
/// wind the server down.
///
/// # Platform Support
///
/// * **Unix platforms**: SIGINT and SIGTERM
/// * **Windows**: Ctrl+C
///
/// # Returns
///
/// `Ok(())` once a shutdown signal is received, or an error if the signal
/// handlers could not be installed.
///
/// # Example
///
/// ```ignore
/// let server = Arc::new(server);
/// let stopper = server.clone();
/// tokio::spawn(async move {
///     signals::wait_for_shutdown().await?;
///     stopper.shutdown();
///     anyhow::Ok(())
/// });
/// server.start().await?;
/// ```
pub async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}
