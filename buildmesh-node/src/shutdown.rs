//! Graceful shutdown coordination.

use tokio_util::sync::CancellationToken;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating shutdown...");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}

/// Cancel `token` when a shutdown signal arrives.
///
/// If the handlers cannot be installed the token is left alone and the
/// process only stops when its work completes.
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            result = wait_for_shutdown_signal() => match result {
                Ok(()) => token.cancel(),
                Err(e) => tracing::warn!(error = %e, "Failed to install signal handlers"),
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watcher_exits_with_token() {
        let token = CancellationToken::new();
        let watcher = cancel_on_signal(token.clone());

        token.cancel();
        watcher.await.unwrap();
        assert!(token.is_cancelled());
    }
}
