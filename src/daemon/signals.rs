// Signal handling for graceful shutdown

use crate::error::{HopscopeError, Result};
use tokio::signal::unix::{signal, Signal as TokioSignal, SignalKind};

/// Signal handler that manages multiple Unix signals
pub struct SignalHandler {
    sigterm: TokioSignal,
    sigint: TokioSignal,
    sighup: TokioSignal,
}

impl SignalHandler {
    /// Sets up handlers for SIGTERM, SIGINT and SIGHUP
    pub fn new() -> Result<Self> {
        Ok(Self {
            sigterm: install(SignalKind::terminate(), "SIGTERM")?,
            sigint: install(SignalKind::interrupt(), "SIGINT")?,
            sighup: install(SignalKind::hangup(), "SIGHUP")?,
        })
    }

    /// Wait for any signal to be received
    /// Returns the name of the signal
    pub async fn wait(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sighup.recv() => "SIGHUP",
        };
        tracing::info!("Received {}", name);
        name
    }

    /// Resolves once a shutdown signal arrives
    pub async fn shutdown(mut self) {
        let sig = self.wait().await;
        tracing::info!("Shutting down on {}", sig);
    }
}

fn install(kind: SignalKind, name: &str) -> Result<TokioSignal> {
    signal(kind).map_err(|e| HopscopeError::Io {
        source: e,
        context: format!("Failed to setup {} handler", name),
    })
}
