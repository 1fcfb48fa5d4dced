//! Reverse proxy control
//!
//! The proxy runs one of two configurations ([`ProxyConfigVariant`]):
//! HTTP-only while no certificate exists, and TLS with an HTTP redirect
//! once one does. Both keep `/.well-known/acme-challenge/` served from the
//! webroot so renewals never need the proxy to be reconfigured.
//!
//! # Components
//!
//! - [`ProxyConfigManager`] - the control surface the orchestrator drives
//! - [`CommandProxyManager`] - implementation running configured commands
//! - [`TemplateSet`] - renders the two config variants
//! - [`ProxyState`] - persisted record of the active variant and process

mod manager;
mod state;
mod template;

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

use certpilot_common::ProxyConfigVariant;

pub use manager::CommandProxyManager;
pub use state::ProxyState;
pub use template::{TemplateContext, TemplateSet, HTTP_ONLY_TEMPLATE, TLS_REDIRECT_TEMPLATE};

/// Errors from proxy configuration and process control
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A variant could not be rendered or failed the syntax check
    #[error("Invalid {variant} proxy configuration: {message}")]
    Config {
        variant: ProxyConfigVariant,
        message: String,
    },

    /// The proxy did not come up
    #[error("Failed to start proxy: {0}")]
    Start(String),

    /// A control command exited unsuccessfully
    #[error("Proxy command '{command}' failed: {message}")]
    Command { command: String, message: String },

    /// A control command did not finish in time
    #[error("Proxy command '{command}' timed out after {}s", .elapsed.as_secs())]
    Timeout {
        command: String,
        elapsed: std::time::Duration,
    },

    /// Something still listens on an address the proxy should have released
    #[error("Address {0} is still in use")]
    PortBusy(SocketAddr),

    /// The operation needs a running proxy
    #[error("Proxy is not running")]
    NotRunning,

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ProxyError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Control surface over the reverse proxy
///
/// Implementations own the active config file and the proxy process. The
/// orchestrator never touches either directly, which is what lets tests
/// substitute an in-memory fake.
#[async_trait]
pub trait ProxyConfigManager: Send + Sync {
    /// Render `variant` to the staged file and run the syntax check.
    ///
    /// Never touches the active configuration.
    async fn verify_config(&self, variant: ProxyConfigVariant) -> Result<(), ProxyError>;

    /// Stage, verify, then atomically activate `variant`.
    ///
    /// On any failure the previously active file is left in place. The
    /// running proxy is not signalled; follow with [`reload`](Self::reload)
    /// or [`restart`](Self::restart).
    async fn select_variant(&self, variant: ProxyConfigVariant) -> Result<(), ProxyError>;

    /// Start the proxy on the active configuration and wait until it
    /// listens. Returns the process id when the proxy is supervised.
    async fn start(&self) -> Result<Option<u32>, ProxyError>;

    /// Stop the proxy and wait for it to exit
    async fn stop(&self) -> Result<(), ProxyError>;

    /// Graceful reload, for when only certificate material changed
    async fn reload(&self) -> Result<(), ProxyError>;

    /// Full restart, for when the set of listening sockets changes
    async fn restart(&self) -> Result<Option<u32>, ProxyError>;

    async fn is_running(&self) -> bool;

    /// Whether `addr` can be bound, i.e. the proxy let go of it
    async fn port_released(&self, addr: SocketAddr) -> bool;
}
