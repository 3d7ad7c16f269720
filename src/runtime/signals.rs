//! Termination signals.
//!
//! On Unix both SIGINT and SIGTERM start a graceful shutdown. Signals keep
//! arriving after the first one; each is reported so the host can log it.

/// Stream of termination signals.
#[cfg(unix)]
pub struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    /// Install the signal handlers.
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal and return its name.
    pub async fn recv(&mut self) -> Option<&'static str> {
        tokio::select! {
            received = self.sigint.recv() => received.map(|_| "SIGINT"),
            received = self.sigterm.recv() => received.map(|_| "SIGTERM"),
        }
    }
}

/// Stream of termination signals.
#[cfg(not(unix))]
pub struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|_| "ctrl-c")
    }
}
