//! Signal handling for renewal checks and shutdown.
//!
//! Bridges OS signals with the async runtime: SIGHUP requests an immediate
//! renewal check, SIGTERM/SIGINT cancel in-flight work and stop the daemon.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Signal type for cross-task communication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Check the certificate now (SIGHUP)
    Reload,
    /// Graceful shutdown (SIGTERM/SIGINT)
    Shutdown,
}

/// Signal manager for handling OS signals with async integration
///
/// Shutdown is broadcast through a [`CancellationToken`] that the
/// orchestrator and scheduler observe; reloads wake the scheduler through a
/// shared [`Notify`].
#[derive(Debug, Clone)]
pub struct SignalManager {
    shutdown: CancellationToken,
    reload: Arc<Notify>,
}

impl SignalManager {
    /// Create a new signal manager
    pub fn new() -> Self {
        debug!("Creating signal manager");
        Self {
            shutdown: CancellationToken::new(),
            reload: Arc::new(Notify::new()),
        }
    }

    /// Token cancelled on shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Notified on reload
    pub fn reload_trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.reload)
    }

    /// Act on a received signal
    pub fn dispatch(&self, signal: SignalType) {
        match signal {
            SignalType::Reload => {
                info!("Received SIGHUP, requesting certificate check");
                self.reload.notify_one();
            }
            SignalType::Shutdown => {
                info!("Received shutdown signal, stopping");
                self.shutdown.cancel();
            }
        }
    }

    /// Install the OS signal listeners on the current runtime
    ///
    /// A second SIGTERM/SIGINT after shutdown has begun is only logged; the
    /// run in progress still restores the proxy before exiting.
    pub fn install(&self) -> std::io::Result<()> {
        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = hangup.recv() => SignalType::Reload,
                    Some(()) = terminate.recv() => SignalType::Shutdown,
                    Some(()) = interrupt.recv() => SignalType::Shutdown,
                    else => break,
                };

                if received == SignalType::Shutdown && manager.shutdown.is_cancelled() {
                    warn!("Shutdown already in progress");
                    continue;
                }
                manager.dispatch(received);
            }
        });

        debug!("Installed signal handlers");
        Ok(())
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}
