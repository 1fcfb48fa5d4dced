//! Configuration structures
//!
//! Every field has a default so a file only needs the domain, the contact
//! email and the proxy start command. Field names are kebab-case in every
//! format so KDL, TOML and JSON files read the same.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

use certpilot_common::{ChallengeStrategy, PollPolicy, RetryPolicy};

/// Main configuration structure for certpilot
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Managed domain and ACME contact
    #[serde(default)]
    #[validate(nested)]
    pub domain: DomainConfig,

    /// Certificate authority and storage settings
    #[serde(default)]
    #[validate(nested)]
    pub acme: AcmeConfig,

    /// Reverse proxy control
    #[serde(default)]
    #[validate(nested)]
    pub proxy: ProxyConfig,

    /// Health probing through the proxy
    #[serde(default)]
    #[validate(nested)]
    pub health: HealthConfig,

    /// How long a run waits for the per-domain lock
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,

    /// Prometheus textfile written after every run
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: DomainConfig::default(),
            acme: AcmeConfig::default(),
            proxy: ProxyConfig::default(),
            health: HealthConfig::default(),
            lock_wait_secs: default_lock_wait_secs(),
            metrics_file: None,
        }
    }
}

impl Config {
    pub fn lock_wait(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(250), Duration::from_secs(self.lock_wait_secs))
    }
}

/// Domain identity
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct DomainConfig {
    /// Fully qualified domain name
    #[serde(default)]
    #[validate(custom(function = "validate_domain_name"))]
    pub name: String,

    /// Admin contact registered with the CA
    #[serde(default)]
    #[validate(email(message = "admin contact must be an email address"))]
    pub email: String,
}

/// ACME settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct AcmeConfig {
    /// Explicit directory URL; overrides `staging`
    #[serde(default)]
    pub directory: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[serde(default)]
    pub staging: bool,

    /// Root of certificate, account and state storage
    #[serde(default = "default_storage")]
    pub storage: PathBuf,

    /// Document root the proxy serves `/.well-known/acme-challenge/` from
    #[serde(default = "default_webroot")]
    pub webroot: PathBuf,

    /// Bind address of the standalone challenge listener
    #[serde(default = "default_standalone_address")]
    pub standalone_address: String,

    /// Upper bound for one issuance attempt
    #[serde(default = "default_attempt_timeout_secs")]
    #[validate(range(min = 10, max = 3600))]
    pub attempt_timeout_secs: u64,

    /// Renew when the certificate expires within this many days
    #[serde(default = "default_renew_before_days")]
    #[validate(range(min = 1, max = 89))]
    pub renew_before_days: u32,

    /// Renewal scheduler period
    #[serde(default = "default_check_interval_hours")]
    #[validate(range(min = 1, max = 168))]
    pub check_interval_hours: u64,

    /// Challenge strategies in the order they are tried
    #[serde(default = "ChallengeStrategy::default_order")]
    #[validate(length(min = 1, message = "at least one challenge strategy is required"))]
    pub strategies: Vec<ChallengeStrategy>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory: None,
            staging: false,
            storage: default_storage(),
            webroot: default_webroot(),
            standalone_address: default_standalone_address(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            renew_before_days: default_renew_before_days(),
            check_interval_hours: default_check_interval_hours(),
            strategies: ChallengeStrategy::default_order(),
        }
    }
}

impl AcmeConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn renew_threshold(&self) -> Duration {
        Duration::from_secs(u64::from(self.renew_before_days) * 86_400)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_hours * 3600)
    }
}

/// Reverse proxy control
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    /// Active proxy config file, replaced on variant switch
    #[serde(default = "default_proxy_config_path")]
    pub config_path: PathBuf,

    /// Template for the HTTP-only variant (embedded nginx template if unset)
    #[serde(default)]
    pub http_only_template: Option<PathBuf>,

    /// Template for the TLS variant (embedded nginx template if unset)
    #[serde(default)]
    pub tls_template: Option<PathBuf>,

    /// Upstream the templates forward to
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Starts the proxy; `{config}` expands to `config-path`
    #[serde(default)]
    pub start_command: Vec<String>,

    /// Stops the proxy; empty means SIGTERM to the managed process
    #[serde(default)]
    pub stop_command: Vec<String>,

    /// Graceful reload; empty means SIGHUP to the managed process
    #[serde(default)]
    pub reload_command: Vec<String>,

    /// Hard restart; empty means stop followed by start
    #[serde(default)]
    pub restart_command: Vec<String>,

    /// Syntax check; `{config}` expands to the staged file
    #[serde(default)]
    pub test_command: Vec<String>,

    /// Liveness check; empty means a TCP connect to `http-address`
    #[serde(default)]
    pub status_command: Vec<String>,

    /// The start command stays in the foreground and is supervised
    #[serde(default)]
    pub foreground: bool,

    /// Where the proxy's HTTP listener is reachable locally
    #[serde(default = "default_http_address")]
    pub http_address: String,

    /// Where the proxy's HTTPS listener is reachable locally
    #[serde(default = "default_https_address")]
    pub https_address: String,

    #[serde(default = "default_start_retries")]
    #[validate(range(min = 1, max = 20))]
    pub start_retries: u32,

    #[serde(default = "default_start_backoff_secs")]
    pub start_backoff_secs: u64,

    /// Timeout for any single proxy command
    #[serde(default = "default_command_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub command_timeout_secs: u64,

    /// How long a stopped proxy may take to release its ports
    #[serde(default = "default_stop_grace_secs")]
    #[validate(range(min = 1, max = 300))]
    pub stop_grace_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            config_path: default_proxy_config_path(),
            http_only_template: None,
            tls_template: None,
            backend: default_backend(),
            start_command: Vec::new(),
            stop_command: Vec::new(),
            reload_command: Vec::new(),
            restart_command: Vec::new(),
            test_command: Vec::new(),
            status_command: Vec::new(),
            foreground: false,
            http_address: default_http_address(),
            https_address: default_https_address(),
            start_retries: default_start_retries(),
            start_backoff_secs: default_start_backoff_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl ProxyConfig {
    pub fn start_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.start_retries,
            initial_backoff: Duration::from_secs(self.start_backoff_secs),
            max_backoff: Duration::from_secs(self.start_backoff_secs.saturating_mul(8)),
            multiplier: 2.0,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Port of the HTTP listener, used in templates
    pub fn http_port(&self) -> u16 {
        port_of(&self.http_address).unwrap_or(80)
    }

    /// Port of the HTTPS listener, used in templates and probe URLs
    pub fn https_port(&self) -> u16 {
        port_of(&self.https_address).unwrap_or(443)
    }
}

/// Health probing
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct HealthConfig {
    /// Backend readiness path, requested through the proxy
    #[serde(default = "default_health_path")]
    #[validate(custom(function = "validate_absolute_path"))]
    pub path: String,

    /// Statuses that count as healthy
    #[serde(default = "default_expected_status")]
    #[validate(length(min = 1))]
    pub expected_status: Vec<u16>,

    /// Statuses accepted from the HTTP listener once TLS is active
    #[serde(default = "default_redirect_status")]
    #[validate(length(min = 1))]
    pub redirect_status: Vec<u16>,

    #[serde(default = "default_poll_interval_secs")]
    #[validate(range(min = 1, max = 300))]
    pub poll_interval_secs: u64,

    #[serde(default = "default_health_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub timeout_secs: u64,

    /// Resolve the domain to this IP for probes (the local proxy)
    #[serde(default)]
    pub probe_address: Option<String>,

    /// Accept untrusted certificates on HTTPS probes (staging CA)
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            expected_status: default_expected_status(),
            redirect_status: default_redirect_status(),
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
            probe_address: None,
            accept_invalid_certs: false,
        }
    }
}

impl HealthConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

fn port_of(address: &str) -> Option<u16> {
    address
        .parse::<std::net::SocketAddr>()
        .ok()
        .map(|addr| addr.port())
}

// ============================================================================
// Field validators
// ============================================================================

fn validate_domain_name(name: &str) -> Result<(), validator::ValidationError> {
    if name.is_empty() {
        // Reported with a dedicated message by Config::validate
        return Ok(());
    }

    let name = name.trim_end_matches('.');
    let valid = name.len() <= 253
        && name.contains('.')
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });

    if valid {
        Ok(())
    } else {
        let mut err = validator::ValidationError::new("domain_name");
        err.message = Some("expected a single fully qualified hostname (no wildcards)".into());
        Err(err)
    }
}

fn validate_absolute_path(path: &str) -> Result<(), validator::ValidationError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(validator::ValidationError::new("absolute_path"))
    }
}

// ============================================================================
// Defaults
// ============================================================================

pub(crate) fn default_lock_wait_secs() -> u64 {
    30
}

pub(crate) fn default_storage() -> PathBuf {
    PathBuf::from("/var/lib/certpilot")
}

pub(crate) fn default_webroot() -> PathBuf {
    PathBuf::from("/var/www/certpilot")
}

pub(crate) fn default_standalone_address() -> String {
    "0.0.0.0:80".to_string()
}

pub(crate) fn default_attempt_timeout_secs() -> u64 {
    300
}

pub(crate) fn default_renew_before_days() -> u32 {
    30
}

pub(crate) fn default_check_interval_hours() -> u64 {
    12
}

pub(crate) fn default_proxy_config_path() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d/certpilot.conf")
}

pub(crate) fn default_backend() -> String {
    "http://127.0.0.1:8000".to_string()
}

pub(crate) fn default_http_address() -> String {
    "127.0.0.1:80".to_string()
}

pub(crate) fn default_https_address() -> String {
    "127.0.0.1:443".to_string()
}

pub(crate) fn default_start_retries() -> u32 {
    3
}

pub(crate) fn default_start_backoff_secs() -> u64 {
    2
}

pub(crate) fn default_command_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_stop_grace_secs() -> u64 {
    10
}

pub(crate) fn default_health_path() -> String {
    "/health/".to_string()
}

pub(crate) fn default_expected_status() -> Vec<u16> {
    vec![200]
}

pub(crate) fn default_redirect_status() -> Vec<u16> {
    vec![301, 302]
}

pub(crate) fn default_poll_interval_secs() -> u64 {
    5
}

pub(crate) fn default_health_timeout_secs() -> u64 {
    120
}
