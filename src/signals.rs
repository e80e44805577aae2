//! Host lifecycle signals.
//!
//! [`shutdown_signal`] completes on the first interrupt, terminate or quit
//! signal, and is meant to be handed to
//! [`Supervisor::attach_shutdown`](crate::supervisor::Supervisor::attach_shutdown)
//! so the worker never outlives the host.

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Infallible variant for [`Supervisor::attach_shutdown`](crate::supervisor::Supervisor::attach_shutdown).
/// If handlers cannot be installed the future never resolves.
pub async fn shutdown_signal() {
    if let Err(e) = wait_for_shutdown_signal().await {
        tracing::error!("Failed to install signal handlers: {}", e);
        std::future::pending::<()>().await;
    }
}
