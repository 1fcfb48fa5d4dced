//! Embedded example configuration, printed by `certpilot test --example`.

/// Annotated example configuration for an nginx deployment
pub const EXAMPLE_CONFIG_KDL: &str = r#"// certpilot configuration
//
// One domain, one proxy. The proxy serves the webroot under
// /.well-known/acme-challenge/ in both variants.

domain "example.com" {
    email "admin@example.com"
}

acme {
    // Use the staging CA while testing to avoid production rate limits
    staging #false
    storage "/var/lib/certpilot"
    webroot "/var/www/certpilot"
    standalone-address "0.0.0.0:80"
    renew-before-days 30
    check-interval-hours 12
    strategies "webroot" "standalone"
}

proxy {
    config-path "/etc/nginx/conf.d/certpilot.conf"
    backend "http://127.0.0.1:8000"
    start-command "nginx"
    stop-command "nginx" "-s" "quit"
    reload-command "nginx" "-s" "reload"
    test-command "nginx" "-t"
    http-address "127.0.0.1:80"
    https-address "127.0.0.1:443"
}

health {
    path "/health/"
    expected-status 200
    redirect-status 301 302
    poll-interval-secs 5
    timeout-secs 120
    probe-address "127.0.0.1"
}

lock-wait-secs 30
"#;
