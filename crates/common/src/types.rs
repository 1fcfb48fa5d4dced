//! Shared domain types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::DomainName;

/// The single domain this installation manages, with its ACME contact.
///
/// Built once from validated configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: DomainName,
    pub email: String,
}

impl Domain {
    pub fn new(name: impl AsRef<str>, email: impl Into<String>) -> Self {
        Self {
            name: DomainName::new(name),
            email: email.into(),
        }
    }

    /// `mailto:` contact URI as sent to the CA
    pub fn contact_uri(&self) -> String {
        format!("mailto:{}", self.email)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The two proxy configurations certpilot switches between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyConfigVariant {
    /// Plain HTTP: serves the backend and the ACME challenge path
    HttpOnly,
    /// HTTPS with an HTTP listener that redirects everything except the
    /// ACME challenge path
    TlsRedirect,
}

impl ProxyConfigVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyConfigVariant::HttpOnly => "http-only",
            ProxyConfigVariant::TlsRedirect => "tls-redirect",
        }
    }

    /// Whether the variant listens on the HTTPS port
    pub fn serves_tls(&self) -> bool {
        matches!(self, ProxyConfigVariant::TlsRedirect)
    }
}

impl fmt::Display for ProxyConfigVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP-01 challenge strategies, tried in configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeStrategy {
    /// Token file written under the proxy's served document root
    Webroot,
    /// Temporary listener bound directly to port 80 while the proxy is stopped
    Standalone,
}

impl ChallengeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStrategy::Webroot => "webroot",
            ChallengeStrategy::Standalone => "standalone",
        }
    }

    /// Whether the strategy needs exclusive use of port 80
    pub fn requires_proxy_down(&self) -> bool {
        matches!(self, ChallengeStrategy::Standalone)
    }

    /// Parse a strategy name, accepting any casing
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webroot" => Some(ChallengeStrategy::Webroot),
            "standalone" => Some(ChallengeStrategy::Standalone),
            _ => None,
        }
    }

    /// Default precedence: no downtime first
    pub fn default_order() -> Vec<ChallengeStrategy> {
        vec![ChallengeStrategy::Webroot, ChallengeStrategy::Standalone]
    }
}

impl fmt::Display for ChallengeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
