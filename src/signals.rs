use crate::Result;
use std::fmt;

/// The signal that requested shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
        }
    }
}

/// Waits for SIGTERM or SIGINT.
#[cfg(unix)]
pub async fn shutdown_signal() -> Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Terminate,
        _ = sigint.recv() => ShutdownSignal::Interrupt,
    };

    log::info!("received {received}, shutting down");
    Ok(received)
}

/// Waits for Ctrl+C.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;

    log::info!("received Ctrl+C, shutting down");
    Ok(ShutdownSignal::Interrupt)
}
