use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install SIGTERM and SIGINT handlers.
///
/// The returned token is cancelled when either signal arrives; the node
/// drains in-flight requests and stops its machines when it fires.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down node"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down node"),
        }
        trigger.cancel();
    });

    Ok(token)
}
