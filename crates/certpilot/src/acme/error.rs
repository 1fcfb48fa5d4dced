//! ACME error types

use std::io;
use std::time::Duration;
use thiserror::Error;

use certpilot_common::ChallengeStrategy;

/// Errors that can occur during ACME operations
#[derive(Debug, Error)]
pub enum AcmeError {
    /// The CA refused the request because a rate limit was hit
    #[error("Rate limited by the certificate authority: {0}")]
    RateLimited(String),

    /// The CA could not validate the HTTP-01 challenge
    #[error("{strategy} challenge failed: {message}")]
    ChallengeFailed {
        strategy: ChallengeStrategy,
        message: String,
    },

    /// Transport or protocol failure talking to the CA
    #[error("Network error talking to the certificate authority: {0}")]
    Network(String),

    /// The attempt exceeded its time box
    #[error("{strategy} issuance timed out after {elapsed:?}")]
    Timeout {
        strategy: ChallengeStrategy,
        elapsed: Duration,
    },

    /// Failed to create or load ACME account
    #[error("ACME account error: {0}")]
    Account(String),

    /// Failed to create certificate order
    #[error("Failed to create certificate order: {0}")]
    Order(String),

    /// Certificate finalization failed
    #[error("Failed to finalize certificate: {0}")]
    Finalization(String),

    /// Certificate parsing error
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The attempt was abandoned because of a shutdown request
    #[error("Issuance cancelled by shutdown")]
    Cancelled,
}

impl AcmeError {
    /// Whether another challenge strategy may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AcmeError::RateLimited(_)
                | AcmeError::ChallengeFailed { .. }
                | AcmeError::Network(_)
                | AcmeError::Timeout { .. }
                | AcmeError::Order(_)
        )
    }

    /// Stable label used in attempt history and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AcmeError::RateLimited(_) => "rate_limited",
            AcmeError::ChallengeFailed { .. } => "challenge_failed",
            AcmeError::Network(_) => "network",
            AcmeError::Timeout { .. } => "timeout",
            AcmeError::Account(_) => "account",
            AcmeError::Order(_) => "order",
            AcmeError::Finalization(_) => "finalization",
            AcmeError::CertificateParse(_) => "certificate_parse",
            AcmeError::Storage(_) => "storage",
            AcmeError::Cancelled => "cancelled",
        }
    }

    /// Classify an ACME problem document by its error URN
    pub fn from_problem(
        strategy: ChallengeStrategy,
        problem_type: Option<&str>,
        detail: Option<&str>,
    ) -> Self {
        let detail = detail.unwrap_or("no detail provided").to_string();
        let kind = problem_type
            .and_then(|t| t.rsplit(':').next())
            .unwrap_or_default();

        match kind {
            "rateLimited" => AcmeError::RateLimited(detail),
            "connection" | "dns" | "incorrectResponse" | "unauthorized" | "tls"
            | "caa" | "rejectedIdentifier" => AcmeError::ChallengeFailed {
                strategy,
                message: format!("{}: {}", kind, detail),
            },
            "accountDoesNotExist" | "invalidContact" | "unsupportedContact" => {
                AcmeError::Account(detail)
            }
            "" => AcmeError::Network(detail),
            other => AcmeError::Network(format!("{}: {}", other, detail)),
        }
    }

    /// Classify an `instant-acme` error raised during the given strategy
    pub fn from_acme(strategy: ChallengeStrategy, e: instant_acme::Error) -> Self {
        match e {
            instant_acme::Error::Api(problem) => {
                Self::from_problem(strategy, problem.r#type.as_deref(), problem.detail.as_deref())
            }
            other => AcmeError::Network(other.to_string()),
        }
    }
}

/// Errors specific to certificate storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize data
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored material violates a bundle invariant
    #[error("Invalid certificate bundle for '{domain}': {reason}")]
    InvalidBundle { domain: String, reason: String },

    /// Certificate PEM could not be parsed
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
