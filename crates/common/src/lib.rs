//! Common utilities and types for certpilot
//!
//! Shared by the configuration crate and the orchestrator:
//!
//! - [`errors`]: cross-crate error type
//! - [`ids`]: run and domain identifier newtypes
//! - [`types`]: domain, proxy variant and challenge strategy enums
//! - [`poll`]: bounded poll and retry policies

pub mod errors;
pub mod ids;
pub mod poll;
pub mod types;

pub use errors::{CertPilotError, CertPilotResult};
pub use ids::{DomainName, RunId};
pub use poll::{PollOutcome, PollPolicy, RetryPolicy};
pub use types::{ChallengeStrategy, Domain, ProxyConfigVariant};
