//! Graceful shutdown signal shared by every stage of a daemon.
//!
//! Stages hold a `watch::Receiver<bool>` and stop taking new work once it
//! flips to `true`, then drain what they hold before returning.

use tokio::sync::watch;

/// Spawn a task that flips the returned channel on SIGINT or SIGTERM.
pub fn install() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let notifier = tx.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received, stopping gracefully");
        let _ = notifier.send(true);
    });

    (tx, rx)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
