//! Configuration linting for best practices
//!
//! Checks configuration for missing best practices and potential issues.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::{Config, LETSENCRYPT_STAGING};
use certpilot_common::ChallengeStrategy;

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.directory_url() == LETSENCRYPT_STAGING {
        result.add_warning(ValidationWarning::new(
            "ACME staging directory in use (certificates will not be browser-trusted)",
        ));
    }

    // A window shorter than the check period can be skipped entirely
    let window_hours = u64::from(config.acme.renew_before_days) * 24;
    if window_hours <= config.acme.check_interval_hours {
        result.add_warning(ValidationWarning::new(format!(
            "Renewal window ({} days) is not longer than the check interval ({} hours)",
            config.acme.renew_before_days, config.acme.check_interval_hours
        )));
    }

    if !config.acme.strategies.contains(&ChallengeStrategy::Standalone) {
        result.add_warning(ValidationWarning::new(
            "Standalone challenge strategy disabled (no fallback if the webroot is not served)",
        ));
    }

    if config.acme.strategies.contains(&ChallengeStrategy::Webroot) && !config.acme.webroot.is_dir()
    {
        result.add_warning(ValidationWarning::new(format!(
            "Webroot {:?} does not exist yet (it is created on first issuance)",
            config.acme.webroot
        )));
    }

    for (name, template) in [
        ("http-only-template", &config.proxy.http_only_template),
        ("tls-template", &config.proxy.tls_template),
    ] {
        if let Some(path) = template {
            if !path.is_file() {
                result.add_error(ValidationError::new(
                    ErrorCategory::Filesystem,
                    format!("proxy.{} {:?} not found", name, path),
                ));
            }
        }
    }

    if config.proxy.reload_command.is_empty() && !config.proxy.foreground {
        result.add_warning(ValidationWarning::new(
            "No proxy reload-command and proxy not supervised in the foreground; \
             variant switches will use a full restart",
        ));
    }

    if config.proxy.test_command.is_empty() {
        result.add_warning(ValidationWarning::new(
            "No proxy test-command; rendered configs are activated without a syntax check",
        ));
    }

    let overlap = config
        .health
        .expected_status
        .iter()
        .any(|s| config.health.redirect_status.contains(s));
    if overlap {
        result.add_error(ValidationError::new(
            ErrorCategory::Logic,
            "health.expected-status and health.redirect-status must not overlap",
        ));
    }

    result
}
