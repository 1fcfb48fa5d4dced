//! Domain, ACME, proxy and health block parsing.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use tracing::trace;

use certpilot_common::ChallengeStrategy;

use crate::model::*;

use super::helpers::{
    get_bool_entry, get_first_arg_string, get_int_args, get_string_args, get_string_entry,
    get_unsigned_entry,
};

/// Parse `domain "name" { email "..." }`
pub fn parse_domain(node: &kdl::KdlNode) -> Result<DomainConfig> {
    trace!("Parsing domain block");

    let name = get_first_arg_string(node).ok_or_else(|| {
        anyhow!("Domain block requires a name argument, e.g., domain \"example.com\" {{ ... }}")
    })?;

    Ok(DomainConfig {
        name,
        email: get_string_entry(node, "email").unwrap_or_default(),
    })
}

/// Parse the `acme` block
pub fn parse_acme(node: &kdl::KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme block");

    let strategies = match get_string_args(node, "strategies") {
        Some(names) => names
            .iter()
            .map(|name| {
                ChallengeStrategy::from_str_loose(name).ok_or_else(|| {
                    anyhow!(
                        "Unknown challenge strategy '{}'. Valid strategies: webroot, standalone",
                        name
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?,
        None => ChallengeStrategy::default_order(),
    };

    let config = AcmeConfig {
        directory: get_string_entry(node, "directory"),
        staging: get_bool_entry(node, "staging").unwrap_or(false),
        storage: get_string_entry(node, "storage")
            .map(PathBuf::from)
            .unwrap_or_else(default_storage),
        webroot: get_string_entry(node, "webroot")
            .map(PathBuf::from)
            .unwrap_or_else(default_webroot),
        standalone_address: get_string_entry(node, "standalone-address")
            .unwrap_or_else(default_standalone_address),
        attempt_timeout_secs: get_unsigned_entry(node, "attempt-timeout-secs")?
            .unwrap_or_else(default_attempt_timeout_secs),
        renew_before_days: get_unsigned_entry(node, "renew-before-days")?
            .unwrap_or_else(default_renew_before_days),
        check_interval_hours: get_unsigned_entry(node, "check-interval-hours")?
            .unwrap_or_else(default_check_interval_hours),
        strategies,
    };

    trace!(
        staging = config.staging,
        storage = %config.storage.display(),
        renew_before_days = config.renew_before_days,
        "Parsed acme block"
    );

    Ok(config)
}

/// Parse the `proxy` block
pub fn parse_proxy(node: &kdl::KdlNode) -> Result<ProxyConfig> {
    trace!("Parsing proxy block");

    let config = ProxyConfig {
        config_path: get_string_entry(node, "config-path")
            .map(PathBuf::from)
            .unwrap_or_else(default_proxy_config_path),
        http_only_template: get_string_entry(node, "http-only-template").map(PathBuf::from),
        tls_template: get_string_entry(node, "tls-template").map(PathBuf::from),
        backend: get_string_entry(node, "backend").unwrap_or_else(default_backend),
        start_command: get_string_args(node, "start-command").unwrap_or_default(),
        stop_command: get_string_args(node, "stop-command").unwrap_or_default(),
        reload_command: get_string_args(node, "reload-command").unwrap_or_default(),
        restart_command: get_string_args(node, "restart-command").unwrap_or_default(),
        test_command: get_string_args(node, "test-command").unwrap_or_default(),
        status_command: get_string_args(node, "status-command").unwrap_or_default(),
        foreground: get_bool_entry(node, "foreground").unwrap_or(false),
        http_address: get_string_entry(node, "http-address").unwrap_or_else(default_http_address),
        https_address: get_string_entry(node, "https-address")
            .unwrap_or_else(default_https_address),
        start_retries: get_unsigned_entry(node, "start-retries")?
            .unwrap_or_else(default_start_retries),
        start_backoff_secs: get_unsigned_entry(node, "start-backoff-secs")?
            .unwrap_or_else(default_start_backoff_secs),
        command_timeout_secs: get_unsigned_entry(node, "command-timeout-secs")?
            .unwrap_or_else(default_command_timeout_secs),
        stop_grace_secs: get_unsigned_entry(node, "stop-grace-secs")?
            .unwrap_or_else(default_stop_grace_secs),
    };

    trace!(
        config_path = %config.config_path.display(),
        foreground = config.foreground,
        "Parsed proxy block"
    );

    Ok(config)
}

/// Parse the `health` block
pub fn parse_health(node: &kdl::KdlNode) -> Result<HealthConfig> {
    trace!("Parsing health block");

    Ok(HealthConfig {
        path: get_string_entry(node, "path").unwrap_or_else(default_health_path),
        expected_status: get_int_args(node, "expected-status")?
            .unwrap_or_else(default_expected_status),
        redirect_status: get_int_args(node, "redirect-status")?
            .unwrap_or_else(default_redirect_status),
        poll_interval_secs: get_unsigned_entry(node, "poll-interval-secs")?
            .unwrap_or_else(default_poll_interval_secs),
        timeout_secs: get_unsigned_entry(node, "timeout-secs")?
            .unwrap_or_else(default_health_timeout_secs),
        probe_address: get_string_entry(node, "probe-address"),
        accept_invalid_certs: get_bool_entry(node, "accept-invalid-certs").unwrap_or(false),
    })
}
