//! Run metrics for observability.
//!
//! Provides Prometheus metrics for:
//! - Orchestrator runs by outcome
//! - Issuance attempts by challenge method and outcome
//! - State machine transitions
//! - Expiry of the live certificate
//!
//! certpilot is mostly a short-lived command, so there is no scrape
//! endpoint; the registry is written to a node-exporter textfile after
//! every run instead.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::debug;

/// Metrics collector owning its own registry
pub struct Metrics {
    registry: Registry,

    /// Completed runs
    /// Labels: outcome
    runs_total: IntCounterVec,

    /// Issuance attempts
    /// Labels: method, outcome
    issuance_attempts: IntCounterVec,

    /// State machine transitions
    /// Labels: from, to
    state_transitions: IntCounterVec,

    /// notAfter of the live certificate as a unix timestamp
    certificate_expiry: IntGauge,
}

impl Metrics {
    /// Create the collectors and register them
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs_total = IntCounterVec::new(
            Opts::new("certpilot_runs_total", "Completed orchestrator runs"),
            &["outcome"],
        )
        .context("Failed to create runs_total metric")?;

        let issuance_attempts = IntCounterVec::new(
            Opts::new(
                "certpilot_issuance_attempts_total",
                "Certificate issuance attempts by challenge method",
            ),
            &["method", "outcome"],
        )
        .context("Failed to create issuance_attempts metric")?;

        let state_transitions = IntCounterVec::new(
            Opts::new(
                "certpilot_state_transitions_total",
                "Orchestrator state machine transitions",
            ),
            &["from", "to"],
        )
        .context("Failed to create state_transitions metric")?;

        let certificate_expiry = IntGauge::new(
            "certpilot_certificate_expiry_timestamp_seconds",
            "Expiry of the live certificate as a unix timestamp",
        )
        .context("Failed to create certificate_expiry metric")?;

        registry
            .register(Box::new(runs_total.clone()))
            .context("Failed to register runs_total metric")?;
        registry
            .register(Box::new(issuance_attempts.clone()))
            .context("Failed to register issuance_attempts metric")?;
        registry
            .register(Box::new(state_transitions.clone()))
            .context("Failed to register state_transitions metric")?;
        registry
            .register(Box::new(certificate_expiry.clone()))
            .context("Failed to register certificate_expiry metric")?;

        Ok(Self {
            registry,
            runs_total,
            issuance_attempts,
            state_transitions,
            certificate_expiry,
        })
    }

    pub fn record_run(&self, outcome: &str) {
        self.runs_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_attempt(&self, method: &str, outcome: &str) {
        self.issuance_attempts
            .with_label_values(&[method, outcome])
            .inc();
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        self.state_transitions.with_label_values(&[from, to]).inc();
    }

    pub fn set_certificate_expiry(&self, unix_timestamp: i64) {
        self.certificate_expiry.set(unix_timestamp);
    }

    /// Render the registry in text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not UTF-8")
    }

    /// Write the registry to `path` through a rename, as the textfile
    /// collector may read it at any moment
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let rendered = self.render()?;
        let tmp = path.with_extension("prom.tmp");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&tmp, rendered).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to rename to {}", path.display()))?;

        debug!(path = %path.display(), "Wrote metrics textfile");
        Ok(())
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
