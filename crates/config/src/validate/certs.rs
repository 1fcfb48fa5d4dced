//! Stored certificate validation
//!
//! Inspects the certificate already on disk for the configured domain, if
//! any. A missing certificate is normal before the first bootstrap; an
//! expired one is a renewal trigger rather than a configuration error.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use chrono::{DateTime, Utc};
use std::path::Path;
use x509_parser::extensions::GeneralName;

/// Validate the stored certificate of the configured domain
pub fn validate_certificates(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let dir = config.domain_dir();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    if !cert_path.exists() {
        tracing::debug!(path = %cert_path.display(), "No stored certificate to validate");
        return result;
    }

    if !key_path.exists() {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "Private key not found: {:?} (certificate present without its key)",
                key_path
            ),
        ));
        return result;
    }

    let domain = certpilot_common::DomainName::new(&config.domain.name);
    match inspect_certificate(&cert_path) {
        Ok(info) => {
            if !info.names.iter().any(|n| n.eq_ignore_ascii_case(domain.as_str())) {
                result.add_error(ValidationError::new(
                    ErrorCategory::Certificate,
                    format!(
                        "Stored certificate {:?} does not cover '{}' (covers: {})",
                        cert_path,
                        domain,
                        info.names.join(", ")
                    ),
                ));
            }

            let now = Utc::now();
            let threshold = chrono::Duration::days(i64::from(config.acme.renew_before_days));
            if info.not_after <= now {
                result.add_warning(ValidationWarning::new(format!(
                    "Stored certificate expired at {} and will be renewed on the next run",
                    info.not_after
                )));
            } else if info.not_after - now < threshold {
                result.add_warning(ValidationWarning::new(format!(
                    "Stored certificate expires soon ({}), inside the {}-day renewal window",
                    info.not_after, config.acme.renew_before_days
                )));
            }
        }
        Err(e) => result.add_error(e),
    }

    result
}

/// Names and expiry extracted from a PEM certificate
#[derive(Debug)]
struct CertificateInfo {
    not_after: DateTime<Utc>,
    names: Vec<String>,
}

fn inspect_certificate(cert_path: &Path) -> Result<CertificateInfo, ValidationError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read certificate {:?}: {}", cert_path, e),
        )
    })?;

    let pem = pem::parse(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse certificate {:?}: {}", cert_path, e),
        )
    })?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 certificate {:?}: {}", cert_path, e),
        )
    })?;

    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| {
            ValidationError::new(
                ErrorCategory::Certificate,
                format!("Certificate {:?} has an unrepresentable expiry", cert_path),
            )
        })?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }

    Ok(CertificateInfo { not_after, names })
}
