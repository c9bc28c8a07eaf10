use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for Ctrl-C and, on unix, SIGTERM.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("Received SIGINT, initiating graceful shutdown"),
                Err(err) => tracing::error!(?err, "Failed to listen for SIGINT, shutting down, error: {err}"),
            },
            _ = terminate() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            tracing::error!(?err, "Failed to install SIGTERM handler, error: {err}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
