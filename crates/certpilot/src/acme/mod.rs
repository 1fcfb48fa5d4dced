//! ACME certificate issuance
//!
//! Obtains and renews the certificate of the managed domain from Let's
//! Encrypt or any RFC 8555 CA.
//!
//! # Features
//!
//! - HTTP-01 challenges through the proxy's webroot or a standalone listener
//! - Persistent storage for certificates, account credentials and attempt history
//! - Background renewal scheduler
//!
//! # Architecture
//!
//! - [`AcmeClient`] - Issuance seam; [`InstantAcmeClient`] wraps `instant-acme`
//! - [`CertificateStore`] - Persistent storage for certificates and account keys
//! - [`ChallengeManager`] / [`WebrootPublisher`] - Where pending challenges live
//! - [`StandaloneServer`] - Port 80 listener used while the proxy is stopped
//! - [`RenewalScheduler`] - Background task for checking and renewing certificates
//!
//! # Challenge Flow
//!
//! 1. [`InstantAcmeClient`] creates an order for the domain
//! 2. The CA returns an HTTP-01 token for the domain's authorization
//! 3. The key authorization is published, as a webroot file or in memory
//! 4. The CA fetches `/.well-known/acme-challenge/<token>` over port 80
//! 5. Once the order is ready it is finalized with a fresh key
//! 6. [`CertificateStore`] archives the previous bundle and installs the new one

mod challenge;
mod client;
mod error;
mod scheduler;
mod standalone;
mod storage;

pub use challenge::{
    ChallengeManager, ChallengeTarget, PublishedChallenges, WebrootPublisher, ACME_CHALLENGE_PREFIX,
};
pub use client::{AcmeClient, AcmeClientSettings, InstantAcmeClient};
pub use error::{AcmeError, StorageError};
pub use scheduler::{RenewalScheduler, TickOutcome};
pub use standalone::StandaloneServer;
pub use storage::{
    parse_certificate_validity, AttemptOutcome, CertificateBundle, CertificateMeta,
    CertificateStore, CertificateValidity, ChallengeAttempt, StoredAccountCredentials,
};
