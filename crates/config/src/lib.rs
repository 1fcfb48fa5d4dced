//! Configuration module for certpilot
//!
//! Parses, validates and lints the single configuration file that drives the
//! certificate orchestrator. KDL is the primary format; TOML and JSON are
//! accepted for deployments that template their config from other tooling.
//!
//! # Module Organization
//!
//! - [`model`]: configuration structures and their defaults
//! - [`validate`]: pre-flight validation and best-practice linting
//! - `kdl`: KDL format parsing
//! - `defaults`: embedded example configuration
//!
//! # Example
//!
//! ```kdl
//! domain "example.test" {
//!     email "admin@example.test"
//! }
//!
//! acme {
//!     staging true
//!     storage "/var/lib/certpilot"
//!     webroot "/var/www/acme"
//! }
//!
//! proxy {
//!     config-path "/etc/nginx/conf.d/certpilot.conf"
//!     start-command "nginx"
//!     reload-command "nginx" "-s" "reload"
//!     test-command "nginx" "-t"
//! }
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use validator::Validate;

use certpilot_common::{CertPilotError, CertPilotResult, Domain, DomainName};

// ============================================================================
// Module Declarations
// ============================================================================

mod defaults;
mod kdl;
pub mod model;
pub mod validate;

// ============================================================================
// Re-exports
// ============================================================================

pub use defaults::EXAMPLE_CONFIG_KDL;
pub use model::{AcmeConfig, Config, DomainConfig, HealthConfig, ProxyConfig};
pub use validate::{
    validate_all, ErrorCategory, ValidationError, ValidationOpts, ValidationResult,
    ValidationWarning,
};

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

impl Config {
    /// Load configuration from a file, choosing the parser by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("kdl");

        tracing::debug!(path = %path.display(), format = extension, "Loading configuration");

        match extension {
            "kdl" => Self::from_kdl(&content),
            "json" => Self::from_json(&content),
            "toml" => Self::from_toml(&content),
            _ => Err(anyhow::anyhow!("Unsupported config format: {}", extension)),
        }
    }

    /// Parse configuration from KDL format
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc: ::kdl::KdlDocument = content
            .parse()
            .map_err(|e: ::kdl::KdlError| anyhow::anyhow!(kdl::render_parse_error(content, &e)))?;

        kdl::parse_kdl_document(doc)
    }

    /// Parse configuration from JSON format
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse JSON configuration")
    }

    /// Parse configuration from TOML format
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }

    /// Validate the configuration.
    ///
    /// Runs once at startup, before any proxy command or CA request, so a
    /// missing domain or contact email never reaches the network.
    pub fn validate(&self) -> CertPilotResult<()> {
        if self.domain.name.trim().is_empty() {
            return Err(CertPilotError::config(
                "Missing domain name (set `domain \"example.com\"` or --domain)",
            ));
        }
        if self.domain.email.trim().is_empty() {
            return Err(CertPilotError::config(
                "Missing admin contact email (set `email` in the domain block or --email)",
            ));
        }

        Validate::validate(self).map_err(|e| CertPilotError::Config {
            message: format!("Configuration validation failed: {}", e),
            source: None,
        })?;

        if self.proxy.start_command.is_empty() {
            return Err(CertPilotError::config(
                "proxy.start-command is required to bring the proxy up",
            ));
        }

        for (name, address) in [
            ("acme.standalone-address", &self.acme.standalone_address),
            ("proxy.http-address", &self.proxy.http_address),
            ("proxy.https-address", &self.proxy.https_address),
        ] {
            address.parse::<std::net::SocketAddr>().map_err(|e| CertPilotError::Config {
                message: format!("{} '{}' is not a socket address", name, address),
                source: Some(Box::new(e)),
            })?;
        }

        if let Some(ref directory) = self.acme.directory {
            let url = url::Url::parse(directory).map_err(|e| CertPilotError::Config {
                message: format!("acme.directory '{}' is not a URL", directory),
                source: Some(Box::new(e)),
            })?;
            if url.scheme() != "https" {
                return Err(CertPilotError::config(format!(
                    "acme.directory '{}' must use https",
                    directory
                )));
            }
        }

        if let Some(ref ip) = self.health.probe_address {
            ip.parse::<std::net::IpAddr>().map_err(|e| CertPilotError::Config {
                message: format!("health.probe-address '{}' is not an IP address", ip),
                source: Some(Box::new(e)),
            })?;
        }

        Ok(())
    }

    /// The validated domain identity
    pub fn domain(&self) -> Domain {
        Domain::new(&self.domain.name, self.domain.email.clone())
    }

    /// Directory holding the live certificate, key and metadata of the domain
    pub fn domain_dir(&self) -> PathBuf {
        self.acme
            .storage
            .join("domains")
            .join(DomainName::new(&self.domain.name).as_str())
    }

    /// ACME directory URL, honoring an explicit override
    pub fn directory_url(&self) -> &str {
        match self.acme.directory {
            Some(ref url) => url,
            None if self.acme.staging => LETSENCRYPT_STAGING,
            None => LETSENCRYPT_PRODUCTION,
        }
    }

    /// Create a minimal configuration for tests
    pub fn default_for_testing() -> Self {
        let mut config = Config::default();
        config.domain = DomainConfig {
            name: "example.test".to_string(),
            email: "admin@example.test".to_string(),
        };
        config.proxy.start_command = vec!["true".to_string()];
        config
    }
}
