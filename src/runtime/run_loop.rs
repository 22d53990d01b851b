//! # Run Loop
//!
//! Starts the engine on the secret store's change feed and runs until
//! SIGINT/SIGTERM.

use crate::runtime::initialization::InitializationResult;
use crate::source::ChangeFeed;
use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

/// Run the engine until a shutdown signal arrives
pub async fn run(init: InitializationResult) -> Result<()> {
    let InitializationResult {
        engine,
        secrets,
        server_state,
        server_handle,
    } = init;

    engine.start(secrets.subscribe());
    server_state.set_ready(true);
    info!("Engine running, waiting for shutdown signal");

    shutdown_signal().await?;

    server_state.set_ready(false);
    info!("Marked server as not ready, waiting for in-flight operations to complete...");
    engine.shutdown().await;

    if let Some(handle) = server_handle {
        handle.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or, on unix, SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            info!("Received SIGINT, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_triggers_shutdown() {
        let waiter = tokio::spawn(shutdown_signal());
        // Let the handler install before raising the signal
        tokio::time::sleep(Duration::from_millis(50)).await;
        raise_sigterm();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("SIGTERM did not end the wait")
            .expect("signal task panicked");
        assert!(result.is_ok());
    }

    fn raise_sigterm() {
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .expect("kill is available");
        assert!(status.success());
    }
}
