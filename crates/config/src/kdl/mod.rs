//! KDL configuration parsing.
//!
//! - `helpers`: common parsing utility functions
//! - `sections`: domain, acme, proxy and health block parsers

mod helpers;
mod sections;

pub use helpers::offset_to_line_col;

use anyhow::{anyhow, Result};
use std::path::PathBuf;

use crate::Config;

// ============================================================================
// Top-Level Document Parser
// ============================================================================

/// Convert a parsed KDL document to Config
pub fn parse_kdl_document(doc: ::kdl::KdlDocument) -> Result<Config> {
    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "domain" => {
                config.domain = sections::parse_domain(node)?;
            }
            "acme" => {
                config.acme = sections::parse_acme(node)?;
            }
            "proxy" => {
                config.proxy = sections::parse_proxy(node)?;
            }
            "health" => {
                config.health = sections::parse_health(node)?;
            }
            "lock-wait-secs" => {
                let value = node
                    .entries()
                    .first()
                    .and_then(|e| e.value().as_integer())
                    .ok_or_else(|| anyhow!("'lock-wait-secs' expects an integer"))?;
                config.lock_wait_secs = u64::try_from(value)
                    .map_err(|_| anyhow!("'lock-wait-secs' must not be negative"))?;
            }
            "metrics-file" => {
                let path = helpers::get_first_arg_string(node)
                    .ok_or_else(|| anyhow!("'metrics-file' expects a path"))?;
                config.metrics_file = Some(PathBuf::from(path));
            }
            other => {
                return Err(anyhow!(
                    "Unknown top-level configuration block: '{}'\n\
                     Valid blocks are: domain, acme, proxy, health, lock-wait-secs, metrics-file",
                    other
                ));
            }
        }
    }

    Ok(config)
}

/// Render a KDL parse error with line/column context
pub fn render_parse_error(content: &str, e: &::kdl::KdlError) -> String {
    use miette::Diagnostic;

    let mut error_msg = String::new();
    error_msg.push_str("KDL configuration parse error:\n\n");

    let mut found_details = false;
    if let Some(related) = e.related() {
        for diagnostic in related {
            error_msg.push_str(&format!("  {}\n", diagnostic));
            found_details = true;

            if let Some(labels) = diagnostic.labels() {
                for label in labels {
                    let (line, col) = offset_to_line_col(content, label.offset());
                    error_msg.push_str(&format!("\n  --> at line {}, column {}\n", line, col));

                    if let Some(line_content) = content.lines().nth(line.saturating_sub(1)) {
                        error_msg.push_str(&format!("{:>4} | {}\n", line, line_content));
                        error_msg
                            .push_str(&format!("     | {}^", " ".repeat(col.saturating_sub(1))));
                        if let Some(label_msg) = label.label() {
                            error_msg.push_str(&format!(" {}", label_msg));
                        }
                        error_msg.push('\n');
                    }
                }
            }

            if let Some(help) = diagnostic.help() {
                error_msg.push_str(&format!("\n  Help: {}\n", help));
            }
        }
    }

    if !found_details {
        error_msg.push_str(&format!("  {}\n", e));
        error_msg.push_str("\n  Note: Check your KDL syntax. Common issues:\n");
        error_msg.push_str("    - Unclosed strings (missing closing quote)\n");
        error_msg.push_str("    - Unclosed blocks (missing closing brace)\n");
    }

    error_msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use certpilot_common::ChallengeStrategy;

    fn parse(content: &str) -> Result<Config> {
        let doc: ::kdl::KdlDocument = content.parse()?;
        parse_kdl_document(doc)
    }

    #[test]
    fn test_parse_full_document() {
        let config = parse(
            r#"
            domain "Example.test" {
                email "admin@example.test"
            }
            acme {
                staging #true
                storage "/tmp/certpilot"
                webroot "/tmp/webroot"
                standalone-address "0.0.0.0:8080"
                renew-before-days 21
                strategies "standalone" "webroot"
            }
            proxy {
                config-path "/tmp/nginx/site.conf"
                start-command "nginx" "-g" "daemon off;"
                reload-command "nginx" "-s" "reload"
                test-command "nginx" "-t" "-c" "{config}"
                foreground #true
                start-retries 5
            }
            health {
                path "/ready"
                expected-status 200 204
                timeout-secs 60
                probe-address "127.0.0.1"
            }
            lock-wait-secs 10
            metrics-file "/tmp/certpilot.prom"
            "#,
        )
        .unwrap();

        assert_eq!(config.domain.name, "Example.test");
        assert_eq!(config.domain.email, "admin@example.test");
        assert!(config.acme.staging);
        assert_eq!(config.acme.storage, PathBuf::from("/tmp/certpilot"));
        assert_eq!(config.acme.renew_before_days, 21);
        assert_eq!(
            config.acme.strategies,
            vec![ChallengeStrategy::Standalone, ChallengeStrategy::Webroot]
        );
        assert_eq!(config.proxy.start_command, vec!["nginx", "-g", "daemon off;"]);
        assert_eq!(config.proxy.test_command.last().map(String::as_str), Some("{config}"));
        assert!(config.proxy.foreground);
        assert_eq!(config.proxy.start_retries, 5);
        assert_eq!(config.health.path, "/ready");
        assert_eq!(config.health.expected_status, vec![200, 204]);
        assert_eq!(config.health.redirect_status, vec![301, 302]);
        assert_eq!(config.health.timeout_secs, 60);
        assert_eq!(config.lock_wait_secs, 10);
        assert_eq!(config.metrics_file, Some(PathBuf::from("/tmp/certpilot.prom")));
    }

    #[test]
    fn test_defaults_when_blocks_missing() {
        let config = parse(r#"domain "example.test" { email "a@example.test"; }"#).unwrap();
        assert_eq!(config.acme.renew_before_days, 30);
        assert_eq!(config.acme.strategies, ChallengeStrategy::default_order());
        assert!(config.proxy.start_command.is_empty());
        assert_eq!(config.lock_wait_secs, 30);
    }

    #[test]
    fn test_unknown_block_rejected() {
        let err = parse("listeners {}").unwrap_err();
        assert!(err.to_string().contains("Unknown top-level configuration block"));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = parse(r#"acme { strategies "dns"; }"#).unwrap_err();
        assert!(err.to_string().contains("dns"));
    }

    #[test]
    fn test_parse_error_rendering() {
        let content = "domain \"example.test {\n";
        let err = content.parse::<::kdl::KdlDocument>().unwrap_err();
        let rendered = render_parse_error(content, &err);
        assert!(rendered.starts_with("KDL configuration parse error"));
    }

    #[test]
    fn test_offset_to_line_col() {
        let content = "ab\ncd\nef";
        assert_eq!(offset_to_line_col(content, 0), (1, 1));
        assert_eq!(offset_to_line_col(content, 4), (2, 2));
        assert_eq!(offset_to_line_col(content, 6), (3, 1));
    }
}
