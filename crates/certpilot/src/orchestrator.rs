//! Bootstrap and renewal state machine
//!
//! One [`Orchestrator::run`] walks the states below under the per-domain
//! lock. Every step failure is mapped to a transition; a run never returns
//! an error, it returns a [`RunReport`] whose [`RunOutcome`] carries the
//! process exit code.
//!
//! ```text
//! Init ──> HttpOnlyUp ──> Validating ──┬──────────────────────────> TlsUp
//!                                      │                              ^
//!                                      ├─> IssuingWebroot ──┐         │
//!                                      │        │ fail      ├─> Switching
//!                                      │        v           │         │ probe fail
//!                                      └─> IssuingStandalone┘         v
//!                                               │ fail            Degraded / Failed
//!                                               v
//!                                           Degraded
//! ```
//!
//! The HTTP-only variant stays reachable throughout: standalone issuance
//! restarts the proxy whatever the outcome, and a failed TLS switch rolls
//! back to HTTP-only before the run ends. `Degraded` is only entered once
//! HTTP-only has answered a health check.
//!
//! A proxy found serving TLS goes `Init → Validating` directly, unless its
//! certificate is missing or expired, or HTTPS is unhealthy while issuance
//! is due. It is then switched back to HTTP-only and follows the path above.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certpilot_common::{
    CertPilotError, CertPilotResult, ChallengeStrategy, Domain, PollPolicy, ProxyConfigVariant,
    RetryPolicy, RunId,
};
use certpilot_config::Config;

use crate::acme::{
    AcmeClient, AcmeClientSettings, AcmeError, AttemptOutcome, CertificateBundle,
    CertificateStore, ChallengeAttempt, InstantAcmeClient,
};
use crate::health::{endpoint_url, HealthCheckResult, HealthProbe, HttpHealthProbe, ProbeError, ProbeRequest};
use crate::lock::DomainLock;
use crate::metrics::Metrics;
use crate::proxy::{CommandProxyManager, ProxyConfigManager, ProxyError, ProxyState};

/// Orchestrator states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    HttpOnlyUp,
    Validating,
    IssuingWebroot,
    IssuingStandalone,
    Switching,
    TlsUp,
    Degraded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::HttpOnlyUp => "http_only_up",
            RunState::Validating => "validating",
            RunState::IssuingWebroot => "issuing_webroot",
            RunState::IssuingStandalone => "issuing_standalone",
            RunState::Switching => "switching",
            RunState::TlsUp => "tls_up",
            RunState::Degraded => "degraded",
            RunState::Failed => "failed",
        }
    }

    /// States a run may end in without having failed
    pub fn is_stable(&self) -> bool {
        matches!(self, RunState::TlsUp | RunState::Degraded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::TlsUp | RunState::Degraded | RunState::Failed)
    }

    fn issuing(strategy: ChallengeStrategy) -> Self {
        match strategy {
            ChallengeStrategy::Webroot => RunState::IssuingWebroot,
            ChallengeStrategy::Standalone => RunState::IssuingStandalone,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a run is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Bring the proxy up and issue only if no unexpired certificate exists
    Bootstrap,
    /// Issue when within the renewal window, or unconditionally with `force`
    Renew { force: bool },
}

/// Result of a run, mapped to the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// A certificate was issued and TLS is active
    Issued,
    /// The existing certificate is still valid, nothing issued
    AlreadyValid,
    /// Every challenge strategy failed; HTTP still served
    IssuanceFailed,
    /// A health check gate failed
    HealthCheckFailed,
    /// The proxy could not be configured, started or stopped
    ProxyFailed,
    /// Another run holds the domain lock
    Busy,
    /// Shutdown requested mid-run
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Issued => 0,
            RunOutcome::AlreadyValid => 2,
            RunOutcome::IssuanceFailed => 3,
            RunOutcome::HealthCheckFailed => 4,
            RunOutcome::ProxyFailed => 5,
            RunOutcome::Busy => 6,
            RunOutcome::Interrupted => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Issued => "issued",
            RunOutcome::AlreadyValid => "already_valid",
            RunOutcome::IssuanceFailed => "issuance_failed",
            RunOutcome::HealthCheckFailed => "health_check_failed",
            RunOutcome::ProxyFailed => "proxy_failed",
            RunOutcome::Busy => "busy",
            RunOutcome::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Everything a run did
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub domain: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: RunState,
    pub outcome: RunOutcome,
    pub transitions: Vec<Transition>,
    pub attempts: Vec<ChallengeAttempt>,
    pub probes: Vec<HealthCheckResult>,
    pub certificate_expires_at: Option<DateTime<Utc>>,
}

impl RunReport {
    /// The sequence of states visited, starting with `Init`
    pub fn path(&self) -> Vec<RunState> {
        std::iter::once(RunState::Init)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// Policy and endpoints the state machine runs with
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Challenge strategies, first success wins
    pub strategies: Vec<ChallengeStrategy>,
    pub renew_threshold: Duration,
    pub start_retry: RetryPolicy,
    pub health_policy: PollPolicy,
    /// How long to wait for port 80 after stopping the proxy
    pub port_release: PollPolicy,
    pub standalone_address: SocketAddr,
    pub http_health_url: String,
    pub https_health_url: String,
    /// HTTP URL expected to redirect once TLS is active
    pub redirect_url: String,
    /// Required prefix of the redirect `Location`
    pub redirect_prefix: String,
    pub expected_status: Vec<u16>,
    pub redirect_status: Vec<u16>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> CertPilotResult<Self> {
        let domain = config.domain();
        let host = domain.name.as_str();
        let http_port = config.proxy.http_port();
        let https_port = config.proxy.https_port();

        let standalone_address = config.acme.standalone_address.parse().map_err(|e| CertPilotError::Config {
            message: format!(
                "acme.standalone-address '{}' is not a socket address",
                config.acme.standalone_address
            ),
            source: Some(Box::new(e)),
        })?;

        let mut strategies = Vec::new();
        for strategy in &config.acme.strategies {
            if !strategies.contains(strategy) {
                strategies.push(*strategy);
            }
        }

        Ok(Self {
            strategies,
            renew_threshold: config.acme.renew_threshold(),
            start_retry: config.proxy.start_retry(),
            health_policy: config.health.poll_policy(),
            port_release: PollPolicy::new(Duration::from_millis(250), config.proxy.stop_grace()),
            standalone_address,
            http_health_url: endpoint_url("http", host, http_port, &config.health.path),
            https_health_url: endpoint_url("https", host, https_port, &config.health.path),
            redirect_url: endpoint_url("http", host, http_port, "/"),
            redirect_prefix: format!("https://{}", host),
            expected_status: config.health.expected_status.clone(),
            redirect_status: config.health.redirect_status.clone(),
        })
    }
}

/// Sequences proxy control, issuance and health checks for one domain
pub struct Orchestrator {
    domain: Domain,
    store: Arc<CertificateStore>,
    proxy: Arc<dyn ProxyConfigManager>,
    acme: Arc<dyn AcmeClient>,
    probe: Arc<dyn HealthProbe>,
    settings: OrchestratorSettings,
    lock: DomainLock,
    metrics: Option<Arc<Metrics>>,
    metrics_file: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        domain: Domain,
        store: Arc<CertificateStore>,
        proxy: Arc<dyn ProxyConfigManager>,
        acme: Arc<dyn AcmeClient>,
        probe: Arc<dyn HealthProbe>,
        settings: OrchestratorSettings,
        lock: DomainLock,
    ) -> Self {
        Self {
            domain,
            store,
            proxy,
            acme,
            probe,
            settings,
            lock,
            metrics: None,
            metrics_file: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Record metrics, writing them to `textfile` after each run when set
    pub fn with_metrics(mut self, metrics: Arc<Metrics>, textfile: Option<PathBuf>) -> Self {
        self.metrics = Some(metrics);
        self.metrics_file = textfile;
        self
    }

    /// Abandon in-flight steps when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wire the production components from configuration
    pub fn from_config(config: &Config, cancel: CancellationToken) -> anyhow::Result<Self> {
        let domain = config.domain();
        let store = Arc::new(
            CertificateStore::new(&config.acme.storage)
                .with_context(|| format!("Failed to open storage at {}", config.acme.storage.display()))?,
        );

        let (cert_path, key_path) = store.live_paths(&domain.name);
        let proxy = CommandProxyManager::from_config(config, cert_path, key_path)
            .context("Failed to set up proxy control")?;

        let acme = InstantAcmeClient::new(
            AcmeClientSettings {
                directory_url: config.directory_url().to_string(),
                webroot: config.acme.webroot.clone(),
                standalone_address: config.acme.standalone_address.parse().with_context(|| {
                    format!("Invalid standalone address '{}'", config.acme.standalone_address)
                })?,
                attempt_timeout: config.acme.attempt_timeout(),
                order_poll: PollPolicy::new(Duration::from_secs(2), config.acme.attempt_timeout()),
            },
            Arc::clone(&store),
        );

        let pin = config
            .health
            .probe_address
            .as_deref()
            .map(|ip| ip.parse::<IpAddr>())
            .transpose()
            .context("Invalid health.probe-address")?;
        let probe = HttpHealthProbe::new(
            pin.map(|ip| (domain.name.as_str(), ip)),
            config.health.accept_invalid_certs,
        )?;

        let settings = OrchestratorSettings::from_config(config)?;
        let lock = DomainLock::new(&store.domain_path(&domain.name), config.lock_wait());
        let metrics = Arc::new(Metrics::new()?);

        Ok(Self::new(
            domain,
            store,
            Arc::new(proxy),
            Arc::new(acme),
            Arc::new(probe),
            settings,
            lock,
        )
        .with_metrics(metrics, config.metrics_file.clone())
        .with_cancellation(cancel))
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Execute one run under the domain lock
    pub async fn run(&self, mode: RunMode) -> RunReport {
        let mut run = Run::new(self, mode);

        info!(
            run_id = %run.run_id,
            domain = %self.domain,
            mode = ?mode,
            "Starting run"
        );

        let outcome = match self.lock.acquire().await {
            Ok(Some(_guard)) => run.execute().await,
            Ok(None) => {
                warn!(domain = %self.domain, "Another run holds the domain lock");
                RunOutcome::Busy
            }
            Err(e) => {
                error!(domain = %self.domain, error = %e, "Failed to take the domain lock");
                RunOutcome::Busy
            }
        };

        run.finish(outcome)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("domain", &self.domain)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Mutable state of a single run
struct Run<'a> {
    orch: &'a Orchestrator,
    run_id: RunId,
    mode: RunMode,
    started_at: DateTime<Utc>,
    state: RunState,
    transitions: Vec<Transition>,
    attempts: Vec<ChallengeAttempt>,
    probes: Vec<HealthCheckResult>,
    proxy_state: ProxyState,
    bundle: Option<CertificateBundle>,
}

/// Step failure, already logged, carrying the outcome it maps to
type Step<T> = Result<T, RunOutcome>;

impl<'a> Run<'a> {
    fn new(orch: &'a Orchestrator, mode: RunMode) -> Self {
        let proxy_state = ProxyState::load(&orch.store.domain_path(&orch.domain.name));
        Self {
            orch,
            run_id: RunId::new(),
            mode,
            started_at: Utc::now(),
            state: RunState::Init,
            transitions: Vec::new(),
            attempts: Vec::new(),
            probes: Vec::new(),
            proxy_state,
            bundle: None,
        }
    }

    fn transition(&mut self, to: RunState, reason: impl Into<String>) {
        let reason = reason.into();
        info!(
            run_id = %self.run_id.short(),
            domain = %self.orch.domain,
            from = %self.state,
            to = %to,
            reason = %reason,
            "State transition"
        );

        if let Some(ref metrics) = self.orch.metrics {
            metrics.record_transition(self.state.as_str(), to.as_str());
        }

        self.transitions.push(Transition {
            from: self.state,
            to,
            at: Utc::now(),
            reason,
        });
        self.state = to;
    }

    fn fail(&mut self, outcome: RunOutcome, reason: impl Into<String>) -> RunOutcome {
        self.transition(RunState::Failed, reason);
        outcome
    }

    fn interrupted(&self) -> Step<()> {
        if self.orch.cancel.is_cancelled() {
            warn!(run_id = %self.run_id.short(), state = %self.state, "Run interrupted by shutdown");
            return Err(RunOutcome::Interrupted);
        }
        Ok(())
    }

    fn persist_proxy_state(&self) {
        let dir = self.orch.store.domain_path(&self.orch.domain.name);
        if let Err(e) = self.proxy_state.save(&dir) {
            warn!(error = %e, "Failed to persist proxy state");
        }
    }

    async fn execute(&mut self) -> RunOutcome {
        match self.steps().await {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    async fn steps(&mut self) -> Step<RunOutcome> {
        self.init().await?;
        self.interrupted()?;

        let existing = self.current_bundle();
        if !self.needs_issuance(existing.as_ref()) {
            self.bundle = existing;
            return Ok(self.settle_existing().await);
        }

        let bundle = match self.issue().await? {
            Some(bundle) => bundle,
            None => {
                let outcome = self
                    .degrade(RunOutcome::IssuanceFailed, "all challenge strategies failed".to_string())
                    .await;
                return Ok(outcome);
            }
        };

        if let Some(ref metrics) = self.orch.metrics {
            metrics.set_certificate_expiry(bundle.expires_at.timestamp());
        }
        self.bundle = Some(bundle);
        self.interrupted()?;

        self.transition(RunState::Switching, "certificate issued");
        match self.switch_to_tls().await {
            Ok(()) => {
                self.transition(RunState::TlsUp, "tls verified");
                Ok(RunOutcome::Issued)
            }
            Err(outcome) => Ok(outcome),
        }
    }

    /// `Init → HttpOnlyUp → Validating`, or `Init → Validating` when the
    /// proxy already serves TLS with a usable certificate
    async fn init(&mut self) -> Step<()> {
        let orch = self.orch;
        let running = orch.proxy.is_running().await;

        if running && self.proxy_state.variant == ProxyConfigVariant::TlsRedirect {
            self.proxy_state.running = true;
            if self.tls_gate().await? {
                return Ok(());
            }
            self.fall_back_to_http_only().await?;
        } else if running {
            debug!(domain = %orch.domain, "Proxy already running http-only");
            self.proxy_state.running = true;
        } else {
            if let Err(e) = orch.proxy.select_variant(ProxyConfigVariant::HttpOnly).await {
                error!(error = %e, "HTTP-only configuration rejected");
                return Err(self.fail(RunOutcome::ProxyFailed, e.to_string()));
            }
            self.proxy_state.mark_variant(ProxyConfigVariant::HttpOnly);

            let proxy = &orch.proxy;
            match orch.settings.start_retry.retry("proxy start", move |_| proxy.start()).await {
                Ok(pid) => self.proxy_state.mark_started(pid),
                Err(e) => {
                    error!(error = %e, "Proxy failed to start");
                    self.persist_proxy_state();
                    return Err(self.fail(RunOutcome::ProxyFailed, e.to_string()));
                }
            }
            self.persist_proxy_state();
        }

        self.transition(RunState::HttpOnlyUp, "proxy serving http-only");
        self.interrupted()?;
        self.transition(RunState::Validating, "probing health endpoint");
        self.gate().await
    }

    /// Health gate of a proxy already serving TLS.
    ///
    /// `Ok(false)` asks for a fall back to HTTP-only: the stored certificate
    /// is missing or expired, or HTTPS is unhealthy while issuance is due
    /// anyway. Either way HTTPS cannot pass until a certificate is issued.
    async fn tls_gate(&mut self) -> Step<bool> {
        let existing = self.current_bundle();
        let usable = existing
            .as_ref()
            .is_some_and(|bundle| bundle.is_unexpired(Utc::now()));

        if !usable {
            warn!(domain = %self.orch.domain, "No unexpired certificate behind tls-redirect");
            return Ok(false);
        }

        self.transition(RunState::Validating, "proxy already serving tls-redirect");
        let request = self.gate_request();
        match self.probe(&request).await? {
            Ok(()) => Ok(true),
            Err(e) if self.needs_issuance(existing.as_ref()) => {
                warn!(error = %e, "HTTPS unhealthy with issuance due");
                Ok(false)
            }
            Err(e) => Err(self.fail(RunOutcome::HealthCheckFailed, e.to_string())),
        }
    }

    /// Swap a TLS-serving proxy back to the HTTP-only variant in place
    async fn fall_back_to_http_only(&mut self) -> Step<()> {
        let orch = self.orch;
        warn!(domain = %orch.domain, "Falling back to http-only before issuance");

        let restored = match orch.proxy.select_variant(ProxyConfigVariant::HttpOnly).await {
            Ok(()) => {
                self.proxy_state.mark_variant(ProxyConfigVariant::HttpOnly);
                self.apply().await.map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };
        self.persist_proxy_state();

        match restored {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Could not switch to http-only");
                Err(self.fail(RunOutcome::ProxyFailed, e))
            }
        }
    }

    fn gate_request(&self) -> ProbeRequest {
        let settings = &self.orch.settings;
        let url = if self.proxy_state.variant.serves_tls() {
            settings.https_health_url.clone()
        } else {
            settings.http_health_url.clone()
        };
        ProbeRequest::new(url, settings.expected_status.clone(), settings.health_policy)
    }

    /// Pre-issuance health gate, before any CA budget is spent
    async fn gate(&mut self) -> Step<()> {
        let request = self.gate_request();
        match self.probe(&request).await? {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(RunOutcome::HealthCheckFailed, e.to_string())),
        }
    }

    async fn probe(&mut self, request: &ProbeRequest) -> Step<Result<(), ProbeError>> {
        let result = tokio::select! {
            _ = self.orch.cancel.cancelled() => return Err(RunOutcome::Interrupted),
            result = self.orch.probe.probe(request) => result,
        };

        Ok(result.map(|r| self.probes.push(r)))
    }

    fn current_bundle(&self) -> Option<CertificateBundle> {
        match self.orch.store.load_bundle(&self.orch.domain.name) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(domain = %self.orch.domain, error = %e, "Stored certificate unreadable, treating as absent");
                None
            }
        }
    }

    fn needs_issuance(&self, existing: Option<&CertificateBundle>) -> bool {
        let now = Utc::now();
        match (self.mode, existing) {
            (RunMode::Renew { force: true }, _) => true,
            (_, None) => true,
            (RunMode::Bootstrap, Some(bundle)) => !bundle.is_unexpired(now),
            (RunMode::Renew { force: false }, Some(bundle)) => {
                bundle.needs_renewal(now, self.orch.settings.renew_threshold)
            }
        }
    }

    /// `Validating → TlsUp` without issuance, activating TLS if needed
    async fn settle_existing(&mut self) -> RunOutcome {
        if let (Some(ref metrics), Some(ref bundle)) = (&self.orch.metrics, &self.bundle) {
            metrics.set_certificate_expiry(bundle.expires_at.timestamp());
        }

        if self.proxy_state.variant != ProxyConfigVariant::TlsRedirect {
            if let Err(outcome) = self.switch_to_tls().await {
                return outcome;
            }
        }

        self.transition(RunState::TlsUp, "existing certificate still valid");
        RunOutcome::AlreadyValid
    }

    /// Try strategies in order; `Ok(None)` when all failed
    async fn issue(&mut self) -> Step<Option<CertificateBundle>> {
        let strategies = self.orch.settings.strategies.clone();

        for strategy in strategies {
            self.interrupted()?;
            self.transition(RunState::issuing(strategy), format!("trying {}", strategy));

            let started_at = Utc::now();
            let result = match strategy {
                ChallengeStrategy::Webroot => self.issue_with(strategy).await,
                ChallengeStrategy::Standalone => self.issue_standalone(started_at).await?,
            };
            self.record_attempt(strategy, started_at, &result);

            match result {
                Ok(bundle) => return Ok(Some(bundle)),
                Err(AcmeError::Cancelled) => return Err(RunOutcome::Interrupted),
                Err(e) if !e.is_retryable() => {
                    error!(strategy = %strategy, error = %e, "Issuance failed, not trying other strategies");
                    return Ok(None);
                }
                Err(e) => warn!(strategy = %strategy, error = %e, "Issuance failed"),
            }
        }

        Ok(None)
    }

    async fn issue_with(&self, strategy: ChallengeStrategy) -> Result<CertificateBundle, AcmeError> {
        tokio::select! {
            _ = self.orch.cancel.cancelled() => Err(AcmeError::Cancelled),
            result = self.orch.acme.issue(&self.orch.domain, strategy) => result,
        }
    }

    /// Stop the proxy, issue on port 80, and restart the proxy whatever
    /// happened. The outer error means the proxy could not be brought back.
    async fn issue_standalone(
        &mut self,
        started_at: DateTime<Utc>,
    ) -> Step<Result<CertificateBundle, AcmeError>> {
        let orch = self.orch;
        let strategy = ChallengeStrategy::Standalone;

        let result = match orch.proxy.stop().await {
            Ok(()) => {
                self.proxy_state.mark_stopped();
                self.persist_proxy_state();
                self.issue_on_free_port().await
            }
            Err(e) => {
                error!(error = %e, "Could not stop proxy for standalone issuance");
                Err(AcmeError::ChallengeFailed {
                    strategy,
                    message: format!("proxy did not stop: {}", e),
                })
            }
        };

        // Restart into the untouched, last known-good configuration
        let proxy = &orch.proxy;
        let restarted = orch
            .settings
            .start_retry
            .retry("proxy restart after standalone", move |_| async move {
                if proxy.is_running().await {
                    return Ok(None);
                }
                proxy.start().await
            })
            .await;

        match restarted {
            Ok(pid) => {
                self.proxy_state.mark_started(pid);
                self.persist_proxy_state();
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, "Proxy did not come back after standalone issuance");
                self.persist_proxy_state();
                if let Ok(ref bundle) = result {
                    self.bundle = Some(bundle.clone());
                }
                self.record_attempt(strategy, started_at, &result);
                Err(self.fail(RunOutcome::ProxyFailed, e.to_string()))
            }
        }
    }

    async fn issue_on_free_port(&self) -> Result<CertificateBundle, AcmeError> {
        let orch = self.orch;
        let addr = orch.settings.standalone_address;
        let proxy = &orch.proxy;

        let released = orch
            .settings
            .port_release
            .poll(move |_| async move {
                if proxy.port_released(addr).await {
                    Ok(())
                } else {
                    Err(())
                }
            })
            .await;

        if !released.is_ready() {
            let err = ProxyError::PortBusy(addr);
            error!(error = %err, "Port not released for standalone issuance");
            return Err(AcmeError::ChallengeFailed {
                strategy: ChallengeStrategy::Standalone,
                message: err.to_string(),
            });
        }

        self.issue_with(ChallengeStrategy::Standalone).await
    }

    fn record_attempt(
        &mut self,
        strategy: ChallengeStrategy,
        started_at: DateTime<Utc>,
        result: &Result<CertificateBundle, AcmeError>,
    ) {
        let (outcome, error_kind, error) = match result {
            Ok(_) => (AttemptOutcome::Success, None, None),
            Err(AcmeError::Cancelled) => (AttemptOutcome::Cancelled, Some("cancelled".to_string()), None),
            Err(e) => (AttemptOutcome::Failed, Some(e.kind().to_string()), Some(e.to_string())),
        };

        let attempt = ChallengeAttempt {
            run_id: self.run_id.clone(),
            method: strategy,
            started_at,
            finished_at: Utc::now(),
            outcome,
            error_kind,
            error,
        };

        if let Err(e) = self.orch.store.record_attempt(&self.orch.domain.name, &attempt) {
            warn!(error = %e, "Failed to record challenge attempt");
        }
        if let Some(ref metrics) = self.orch.metrics {
            let label = match outcome {
                AttemptOutcome::Success => "success",
                AttemptOutcome::Failed => "failed",
                AttemptOutcome::Cancelled => "cancelled",
            };
            metrics.record_attempt(strategy.as_str(), label);
        }
        self.attempts.push(attempt);
    }

    /// Activate TLS and verify it; on failure roll back to HTTP-only and
    /// end in `Degraded` (HTTP still healthy) or `Failed`
    async fn switch_to_tls(&mut self) -> Step<()> {
        let orch = self.orch;
        let previous = self.proxy_state.variant;

        if let Err(e) = orch.proxy.select_variant(ProxyConfigVariant::TlsRedirect).await {
            error!(error = %e, "TLS configuration rejected, keeping {}", previous);
            return Err(self.degrade(RunOutcome::ProxyFailed, e.to_string()).await);
        }
        self.proxy_state.mark_variant(ProxyConfigVariant::TlsRedirect);

        if let Err(e) = self.apply().await {
            error!(error = %e, "Proxy did not pick up the TLS configuration");
            return Err(self.roll_back(e.to_string()).await);
        }
        self.persist_proxy_state();

        let settings = &orch.settings;
        let redirect = ProbeRequest::new(
            settings.redirect_url.clone(),
            settings.redirect_status.clone(),
            settings.health_policy,
        )
        .with_location_prefix(settings.redirect_prefix.clone());
        let https = ProbeRequest::new(
            settings.https_health_url.clone(),
            settings.expected_status.clone(),
            settings.health_policy,
        );

        for request in [redirect, https] {
            match self.probe(&request).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "TLS verification failed");
                    return Err(self.roll_back(e.to_string()).await);
                }
                // The switch itself is complete; report the interruption
                Err(outcome) => return Err(outcome),
            }
        }

        Ok(())
    }

    /// Reload, falling back to a restart
    async fn apply(&mut self) -> Result<(), ProxyError> {
        let orch = self.orch;
        let proxy = &orch.proxy;
        match proxy.reload().await {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "Reload failed, restarting proxy");
                let pid = proxy.restart().await?;
                self.proxy_state.mark_started(pid);
            }
        }
        self.proxy_state.mark_reloaded();
        Ok(())
    }

    async fn roll_back(&mut self, reason: String) -> RunOutcome {
        let orch = self.orch;
        warn!(domain = %orch.domain, "Rolling back to http-only");

        let restored = match orch.proxy.select_variant(ProxyConfigVariant::HttpOnly).await {
            Ok(()) => {
                self.proxy_state.mark_variant(ProxyConfigVariant::HttpOnly);
                self.apply().await.map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };
        self.persist_proxy_state();

        if let Err(e) = restored {
            error!(error = %e, "Rollback to http-only failed");
            return self.fail(RunOutcome::ProxyFailed, format!("{}; rollback failed: {}", reason, e));
        }

        self.degrade(RunOutcome::HealthCheckFailed, reason).await
    }

    /// End in `Degraded` once HTTP-only answers its health check, `Failed`
    /// otherwise
    async fn degrade(&mut self, outcome: RunOutcome, reason: String) -> RunOutcome {
        let settings = &self.orch.settings;
        let request = ProbeRequest::new(
            settings.http_health_url.clone(),
            settings.expected_status.clone(),
            settings.health_policy,
        );
        match self.probe(&request).await {
            Ok(Ok(())) => {
                self.transition(RunState::Degraded, reason);
                outcome
            }
            Ok(Err(e)) => self.fail(outcome, format!("{}; http-only unhealthy: {}", reason, e)),
            Err(interrupted) => interrupted,
        }
    }

    fn finish(self, outcome: RunOutcome) -> RunReport {
        let orch = self.orch;

        if let Some(ref metrics) = orch.metrics {
            metrics.record_run(outcome.as_str());
            if let Some(ref path) = orch.metrics_file {
                if let Err(e) = metrics.write_textfile(path) {
                    warn!(error = %e, "Failed to write metrics textfile");
                }
            }
        }

        let report = RunReport {
            run_id: self.run_id,
            domain: orch.domain.name.to_string(),
            mode: self.mode,
            started_at: self.started_at,
            finished_at: Utc::now(),
            final_state: self.state,
            outcome,
            transitions: self.transitions,
            attempts: self.attempts,
            probes: self.probes,
            certificate_expires_at: self.bundle.map(|b| b.expires_at),
        };

        info!(
            run_id = %report.run_id.short(),
            domain = %report.domain,
            state = %report.final_state,
            outcome = report.outcome.as_str(),
            exit_code = report.exit_code(),
            "Run finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let outcomes = [
            RunOutcome::Issued,
            RunOutcome::AlreadyValid,
            RunOutcome::IssuanceFailed,
            RunOutcome::HealthCheckFailed,
            RunOutcome::ProxyFailed,
            RunOutcome::Busy,
            RunOutcome::Interrupted,
        ];
        let mut codes: Vec<i32> = outcomes.iter().map(|o| o.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), outcomes.len());
        assert!(!codes.contains(&1), "1 is reserved for configuration errors");
    }

    #[test]
    fn test_state_classification() {
        assert!(RunState::TlsUp.is_stable());
        assert!(RunState::Degraded.is_stable());
        assert!(!RunState::Failed.is_stable());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Switching.is_terminal());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default_for_testing();
        config.proxy.https_address = "127.0.0.1:8443".to_string();
        config.acme.strategies = vec![
            ChallengeStrategy::Webroot,
            ChallengeStrategy::Standalone,
            ChallengeStrategy::Standalone,
        ];

        let settings = OrchestratorSettings::from_config(&config).unwrap();
        assert_eq!(settings.http_health_url, "http://example.test/health/");
        assert_eq!(settings.https_health_url, "https://example.test:8443/health/");
        assert_eq!(settings.redirect_url, "http://example.test/");
        assert_eq!(settings.redirect_prefix, "https://example.test");
        assert_eq!(
            settings.strategies,
            vec![ChallengeStrategy::Webroot, ChallengeStrategy::Standalone]
        );
    }
}
