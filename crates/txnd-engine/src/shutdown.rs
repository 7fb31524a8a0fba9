use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

/// Cancel `token` on the first SIGTERM or SIGINT.
///
/// Handlers are registered before returning, so a failure to install them is
/// reported to the caller rather than lost in the background task.
pub fn install_signal_handlers(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, draining workers"),
            _ = sigint.recv() => info!("received SIGINT, draining workers"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });

    Ok(())
}
