use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the run on SIGTERM, SIGINT or SIGQUIT.
///
/// Returns a `CancellationToken` cancelled when any of them arrives.
pub fn install_cancel_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, cancelling the run");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, cancelling the run");
            }
            _ = sigquit.recv() => {
                tracing::info!("Received SIGQUIT, cancelling the run");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
