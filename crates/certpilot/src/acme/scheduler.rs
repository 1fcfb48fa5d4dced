//! Background certificate renewal scheduler
//!
//! Periodically checks the live certificate and re-enters the orchestrator's
//! renewal path when it is inside the renewal window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::orchestrator::{Orchestrator, RunMode, RunOutcome, RunReport};

/// Minimum check interval (1 hour)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Result of one scheduler tick
#[derive(Debug)]
pub enum TickOutcome {
    /// Outside the renewal window
    NotDue { expires_at: DateTime<Utc> },
    Renewed(Box<RunReport>),
    /// The renewal run ended without a new certificate
    Failed(Box<RunReport>),
    /// Another run held the domain lock
    Busy,
}

/// Background certificate renewal scheduler
///
/// Runs as a long-lived task. Each tick checks the stored certificate and,
/// when strictly less than the renewal threshold remains, runs the
/// orchestrator with a forced renewal. The orchestrator reloads the proxy
/// itself; a failed tick is logged and retried on the next one.
pub struct RenewalScheduler {
    orchestrator: Arc<Orchestrator>,
    check_interval: Duration,
    /// Out-of-schedule check requests (SIGHUP)
    trigger: Arc<Notify>,
}

impl RenewalScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, check_interval: Duration) -> Self {
        Self {
            orchestrator,
            check_interval: check_interval.max(MIN_CHECK_INTERVAL),
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Use `trigger` to request immediate checks
    pub fn with_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Check once and renew if due
    pub async fn tick(&self) -> TickOutcome {
        let domain = self.orchestrator.domain();
        let threshold = self.orchestrator.settings().renew_threshold;

        match self.orchestrator.store().load_bundle(&domain.name) {
            Ok(Some(bundle)) if !bundle.needs_renewal(Utc::now(), threshold) => {
                debug!(
                    domain = %domain,
                    expires = %bundle.expires_at,
                    "Certificate is still valid"
                );
                return TickOutcome::NotDue {
                    expires_at: bundle.expires_at,
                };
            }
            Ok(Some(bundle)) => {
                info!(domain = %domain, expires = %bundle.expires_at, "Certificate needs renewal");
            }
            Ok(None) => info!(domain = %domain, "No certificate stored, issuing"),
            Err(e) => {
                warn!(domain = %domain, error = %e, "Failed to read stored certificate, renewing");
            }
        }

        let report = self
            .orchestrator
            .run(RunMode::Renew { force: true })
            .await;

        match report.outcome {
            RunOutcome::Issued => {
                info!(
                    domain = %domain,
                    expires = ?report.certificate_expires_at,
                    "Certificate renewed successfully"
                );
                TickOutcome::Renewed(Box::new(report))
            }
            RunOutcome::Busy => {
                warn!(domain = %domain, "Renewal skipped, another run is in progress");
                TickOutcome::Busy
            }
            outcome => {
                error!(
                    domain = %domain,
                    outcome = outcome.as_str(),
                    state = %report.final_state,
                    "Certificate renewal failed, retrying next tick"
                );
                TickOutcome::Failed(Box::new(report))
            }
        }
    }

    /// Run the renewal loop until `cancel` fires
    ///
    /// The first check happens immediately.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            check_interval_hours = self.check_interval.as_secs() / 3600,
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => debug!("Running scheduled certificate renewal check"),
                _ = self.trigger.notified() => info!("Certificate renewal check requested"),
            }

            self.tick().await;
        }

        info!("Certificate renewal scheduler stopped");
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .finish()
    }
}
