//! Health probing through the proxy
//!
//! Probes are read-only GETs repeated under a [`PollPolicy`] until the
//! response matches or the deadline passes. Redirects are never followed:
//! after the TLS switch the HTTP listener must answer with a redirect whose
//! `Location` points at the HTTPS URL, and that response is the thing being
//! checked.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{redirect, Client};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use certpilot_common::{PollOutcome, PollPolicy};

/// Upper bound for a single probe request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What a probe expects from an endpoint
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub url: String,
    /// Statuses counted as success
    pub expected: Vec<u16>,
    pub policy: PollPolicy,
    /// Required prefix of the `Location` header, for redirect checks
    pub location_prefix: Option<String>,
}

impl ProbeRequest {
    pub fn new(url: impl Into<String>, expected: Vec<u16>, policy: PollPolicy) -> Self {
        Self {
            url: url.into(),
            expected,
            policy,
            location_prefix: None,
        }
    }

    /// Also require a `Location` header starting with `prefix`
    pub fn with_location_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.location_prefix = Some(prefix.into());
        self
    }
}

/// A successful probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub endpoint: String,
    pub status: u16,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Requests sent before the endpoint matched
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(
        "Health check of {url} timed out after {attempts} attempts ({}s); last status {}",
        .elapsed.as_secs(),
        .last_status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string())
    )]
    Timeout {
        url: String,
        attempts: u32,
        elapsed: Duration,
        last_status: Option<u16>,
        last_error: Option<String>,
    },

    /// The probe could not be set up at all
    #[error("Health probe client error: {0}")]
    Client(String),
}

/// Polls an endpoint until it answers as expected
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> Result<HealthCheckResult, ProbeError>;
}

/// Build `scheme://domain[:port]path`, omitting the scheme's default port
pub fn endpoint_url(scheme: &str, domain: &str, port: u16, path: &str) -> String {
    let default_port = match scheme {
        "https" => 443,
        _ => 80,
    };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    if port == default_port {
        format!("{}://{}{}", scheme, domain, path)
    } else {
        format!("{}://{}:{}{}", scheme, domain, port, path)
    }
}

/// Observation of a non-matching attempt
#[derive(Debug, Default)]
struct Pending {
    status: Option<u16>,
    error: Option<String>,
}

/// [`HealthProbe`] over HTTP(S) with `reqwest`
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    /// Create a probe client
    ///
    /// # Arguments
    ///
    /// * `pin` - Resolve this host to the given address instead of DNS, so
    ///   the local proxy is probed even before public DNS points at it
    /// * `accept_invalid_certs` - Skip certificate verification (staging CA)
    pub fn new(pin: Option<(&str, IpAddr)>, accept_invalid_certs: bool) -> Result<Self, ProbeError> {
        let mut builder = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(accept_invalid_certs)
            .user_agent(concat!("certpilot/", env!("CARGO_PKG_VERSION")));

        if let Some((host, ip)) = pin {
            // Port 0: reqwest substitutes the URL's port
            builder = builder.resolve(host, SocketAddr::new(ip, 0));
        }

        let client = builder
            .build()
            .map_err(|e| ProbeError::Client(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    async fn check(&self, request: &ProbeRequest) -> Result<HealthCheckResult, Pending> {
        let started = Instant::now();
        let response = self.client.get(&request.url).send().await.map_err(|e| Pending {
            status: None,
            error: Some(e.to_string()),
        })?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        if !request.expected.contains(&status) {
            trace!(url = %request.url, status, "Unexpected status");
            return Err(Pending {
                status: Some(status),
                error: None,
            });
        }

        if let Some(ref prefix) = request.location_prefix {
            let matches = location
                .as_deref()
                .is_some_and(|location| location.starts_with(prefix.as_str()));
            if !matches {
                trace!(url = %request.url, location = ?location, "Redirect target mismatch");
                return Err(Pending {
                    status: Some(status),
                    error: Some(format!(
                        "Location {:?} does not start with {}",
                        location, prefix
                    )),
                });
            }
        }

        Ok(HealthCheckResult {
            endpoint: request.url.clone(),
            status,
            latency: started.elapsed(),
            timestamp: Utc::now(),
            location,
            attempts: 0,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, request: &ProbeRequest) -> Result<HealthCheckResult, ProbeError> {
        debug!(
            url = %request.url,
            expected = ?request.expected,
            timeout_secs = request.policy.timeout.as_secs(),
            "Probing endpoint"
        );

        match request.policy.poll(move |_| self.check(request)).await {
            PollOutcome::Ready { mut value, attempts, .. } => {
                value.attempts = attempts;
                info!(
                    url = %request.url,
                    status = value.status,
                    latency_ms = value.latency.as_millis() as u64,
                    attempts,
                    "Health check passed"
                );
                Ok(value)
            }
            PollOutcome::TimedOut {
                last,
                attempts,
                elapsed,
            } => {
                let last = last.unwrap_or_default();
                warn!(
                    url = %request.url,
                    attempts,
                    last_status = ?last.status,
                    last_error = ?last.error,
                    "Health check timed out"
                );
                Err(ProbeError::Timeout {
                    url: request.url.clone(),
                    attempts,
                    elapsed,
                    last_status: last.status,
                    last_error: last.error,
                })
            }
        }
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
