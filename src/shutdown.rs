//! Process shutdown signals.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Resolve on ctrl-c, or on SIGTERM where the platform has it.
#[cfg(unix)]
pub async fn signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
pub async fn signal() {
    tokio::signal::ctrl_c().await.ok();
}

/// Cancel `token` once `trigger` resolves.
///
/// The task ends early, without cancelling, if the token is cancelled
/// some other way first.
pub fn cancel_on<F>(trigger: F, token: CancellationToken) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = trigger => {
                info!("shutdown signal received, cancelling");
                token.cancel();
            }
        }
    })
}
