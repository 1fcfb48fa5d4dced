//! certpilot Library
//!
//! ACME HTTP-01 certificate bootstrap and renewal for a single domain served
//! by a reverse proxy.
//!
//! This library provides the components the `certpilot` binary wires
//! together:
//!
//! - **Orchestration**: the run state machine that brings the proxy up over
//!   plain HTTP, issues the certificate and switches to HTTPS
//! - **Proxy Control**: templated configuration variants, syntax checks and
//!   lifecycle commands
//! - **ACME**: webroot and standalone HTTP-01 issuance, certificate storage
//!   and the renewal scheduler
//! - **Health Checks**: bounded HTTP/HTTPS probes, including the redirect check
//! - **Locking**: one run per domain across processes
//!
//! # Example
//!
//! ```ignore
//! use certpilot::{Orchestrator, RunMode};
//! use certpilot_config::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::from_file("/etc/certpilot/certpilot.kdl")?;
//! let orchestrator = Orchestrator::from_config(&config, CancellationToken::new())?;
//! let report = orchestrator.run(RunMode::Bootstrap).await;
//! std::process::exit(report.exit_code());
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod proxy;
pub mod signals;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Orchestration
pub use orchestrator::{
    Orchestrator, OrchestratorSettings, RunMode, RunOutcome, RunReport, RunState, Transition,
};

// Proxy control
pub use proxy::{CommandProxyManager, ProxyConfigManager, ProxyError, ProxyState};

// ACME
pub use acme::{
    AcmeClient, AcmeError, CertificateBundle, CertificateStore, InstantAcmeClient,
    RenewalScheduler,
};

// Health checks
pub use health::{HealthCheckResult, HealthProbe, HttpHealthProbe, ProbeRequest};

// Locking and signals
pub use lock::DomainLock;
pub use signals::{SignalManager, SignalType};
