//! Type-safe identifier newtypes for certpilot.
//!
//! These types keep run identifiers and domain names from being mixed up
//! with arbitrary strings as they flow through logs, storage paths and locks.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one orchestrator run.
///
/// Every log line emitted during a bootstrap or renewal carries the run ID,
/// so the interleaved output of a daemon and a manual run stays separable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    /// Create a new random run ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in log prefixes
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified domain name a certificate is issued for.
///
/// Stored lowercased with any trailing dot removed, so `Example.TEST.` and
/// `example.test` map to the same storage directory and the same lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainName(String);

impl DomainName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim_end_matches('.').to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DomainName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DomainName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id() {
        let id1 = RunId::new();
        let id2 = RunId::from_string("test-run");

        assert_ne!(id1, id2);
        assert_eq!(id2.as_str(), "test-run");
        assert_eq!(id1.short().len(), 8);
    }

    #[test]
    fn test_run_id_short_on_short_input() {
        let id = RunId::from_string("abc");
        assert_eq!(id.short(), "abc");
    }

    #[test]
    fn test_domain_name_normalized() {
        let name = DomainName::new("Example.TEST.");
        assert_eq!(name.as_str(), "example.test");
        assert_eq!(name, DomainName::from("example.test"));
        assert_eq!(name.to_string(), "example.test");
    }
}
