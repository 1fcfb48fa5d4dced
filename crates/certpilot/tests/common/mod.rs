//! Shared fakes for orchestrator and scheduler tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use certpilot::acme::{AcmeClient, AcmeError, CertificateBundle, CertificateStore};
use certpilot::health::{HealthCheckResult, HealthProbe, ProbeError, ProbeRequest};
use certpilot::proxy::{ProxyConfigManager, ProxyError};
use certpilot::{DomainLock, Orchestrator, OrchestratorSettings};
use certpilot_common::{ChallengeStrategy, Domain, PollPolicy, ProxyConfigVariant, RetryPolicy};

pub const DOMAIN: &str = "example.test";

/// Self-signed PEM certificate and key valid from yesterday for `days_valid` days
pub fn test_cert(domain: &str, days_valid: i64) -> (String, String) {
    let at = |offset: i64| {
        let d = (Utc::now() + chrono::Duration::days(offset)).date_naive();
        rcgen::date_time_ymd(d.year(), d.month() as u8, d.day() as u8)
    };

    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
    params.not_before = at(-1);
    params.not_after = at(days_valid);
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

// ============================================================================
// Proxy
// ============================================================================

/// In-memory proxy recording every lifecycle call
#[derive(Debug)]
pub struct FakeProxy {
    calls: Mutex<Vec<String>>,
    running: AtomicBool,
    active: Mutex<ProxyConfigVariant>,
    rejected: Mutex<Option<ProxyConfigVariant>>,
    start_fails: AtomicBool,
}

impl FakeProxy {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            active: Mutex::new(ProxyConfigVariant::HttpOnly),
            rejected: Mutex::new(None),
            start_fails: AtomicBool::new(false),
        }
    }

    /// Fail the syntax check of `variant`
    pub fn reject(&self, variant: ProxyConfigVariant) {
        *self.rejected.lock() = Some(variant);
    }

    pub fn fail_starts(&self) {
        self.start_fails.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn active(&self) -> ProxyConfigVariant {
        *self.active.lock()
    }

    pub fn up(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl ProxyConfigManager for FakeProxy {
    async fn verify_config(&self, variant: ProxyConfigVariant) -> Result<(), ProxyError> {
        self.record(format!("verify {}", variant.as_str()));
        if *self.rejected.lock() == Some(variant) {
            return Err(ProxyError::Config {
                variant,
                message: "ssl_certificate: no such file".to_string(),
            });
        }
        Ok(())
    }

    async fn select_variant(&self, variant: ProxyConfigVariant) -> Result<(), ProxyError> {
        self.verify_config(variant).await?;
        self.record(format!("select {}", variant.as_str()));
        *self.active.lock() = variant;
        Ok(())
    }

    async fn start(&self) -> Result<Option<u32>, ProxyError> {
        self.record("start");
        if self.start_fails.load(Ordering::SeqCst) {
            return Err(ProxyError::Start("bind() to 0.0.0.0:80 failed".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(Some(4242))
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        self.record("stop");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        self.record("reload");
        if !self.up() {
            return Err(ProxyError::NotRunning);
        }
        Ok(())
    }

    async fn restart(&self) -> Result<Option<u32>, ProxyError> {
        self.record("restart");
        self.running.store(true, Ordering::SeqCst);
        Ok(Some(4243))
    }

    async fn is_running(&self) -> bool {
        self.up()
    }

    async fn port_released(&self, _addr: SocketAddr) -> bool {
        !self.up()
    }
}

// ============================================================================
// ACME
// ============================================================================

/// What the fake CA does for one strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Succeed,
    /// Retryable challenge failure
    FailChallenge,
    /// Non-retryable account failure
    FailAccount,
}

/// Issues self-signed certificates into the real store
#[derive(Debug)]
pub struct FakeAcme {
    store: Arc<CertificateStore>,
    proxy: Arc<FakeProxy>,
    scripts: Vec<(ChallengeStrategy, Script)>,
    /// Strategy of each call and whether the proxy was up at the time
    calls: Mutex<Vec<(ChallengeStrategy, bool)>>,
    days_valid: i64,
}

impl FakeAcme {
    pub fn new(
        store: Arc<CertificateStore>,
        proxy: Arc<FakeProxy>,
        scripts: Vec<(ChallengeStrategy, Script)>,
    ) -> Self {
        Self {
            store,
            proxy,
            scripts,
            calls: Mutex::new(Vec::new()),
            days_valid: 90,
        }
    }

    pub fn calls(&self) -> Vec<(ChallengeStrategy, bool)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AcmeClient for FakeAcme {
    async fn issue(
        &self,
        domain: &Domain,
        strategy: ChallengeStrategy,
    ) -> Result<CertificateBundle, AcmeError> {
        self.calls.lock().push((strategy, self.proxy.up()));

        let script = self
            .scripts
            .iter()
            .find(|(s, _)| *s == strategy)
            .map(|(_, script)| *script)
            .unwrap_or(Script::FailChallenge);

        match script {
            Script::Succeed => {
                let (cert, key) = test_cert(domain.name.as_str(), self.days_valid);
                Ok(self.store.save_bundle(&domain.name, &cert, &key)?)
            }
            Script::FailChallenge => Err(AcmeError::ChallengeFailed {
                strategy,
                message: "Invalid response from http://example.test/.well-known/acme-challenge/x: 404"
                    .to_string(),
            }),
            Script::FailAccount => Err(AcmeError::Account("account deactivated".to_string())),
        }
    }
}

// ============================================================================
// Health probe
// ============================================================================

/// Answers every probe, except for URLs starting with a failing prefix
#[derive(Debug, Default)]
pub struct FakeProbe {
    failing: Mutex<Vec<String>>,
    probed: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, prefix: &str) {
        self.failing.lock().push(prefix.to_string());
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, request: &ProbeRequest) -> Result<HealthCheckResult, ProbeError> {
        self.probed.lock().push(request.url.clone());

        if self.failing.lock().iter().any(|p| request.url.starts_with(p.as_str())) {
            return Err(ProbeError::Timeout {
                url: request.url.clone(),
                attempts: 1,
                elapsed: Duration::ZERO,
                last_status: Some(502),
                last_error: None,
            });
        }

        Ok(HealthCheckResult {
            endpoint: request.url.clone(),
            status: request.expected.first().copied().unwrap_or(200),
            latency: Duration::from_millis(3),
            timestamp: Utc::now(),
            location: request.location_prefix.as_ref().map(|p| format!("{}/", p)),
            attempts: 1,
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        strategies: vec![ChallengeStrategy::Webroot, ChallengeStrategy::Standalone],
        renew_threshold: Duration::from_secs(30 * 86_400),
        start_retry: RetryPolicy::no_retry(),
        health_policy: PollPolicy::once(),
        port_release: PollPolicy::once(),
        standalone_address: "127.0.0.1:80".parse().unwrap(),
        http_health_url: format!("http://{}/health/", DOMAIN),
        https_health_url: format!("https://{}/health/", DOMAIN),
        redirect_url: format!("http://{}/", DOMAIN),
        redirect_prefix: format!("https://{}", DOMAIN),
        expected_status: vec![200],
        redirect_status: vec![301, 302],
    }
}

/// Orchestrator over fakes and a temporary certificate store
pub struct Harness {
    pub dir: TempDir,
    pub domain: Domain,
    pub store: Arc<CertificateStore>,
    pub proxy: Arc<FakeProxy>,
    pub acme: Arc<FakeAcme>,
    pub probe: Arc<FakeProbe>,
}

impl Harness {
    pub fn new(scripts: Vec<(ChallengeStrategy, Script)>) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CertificateStore::new(dir.path()).unwrap());
        let proxy = Arc::new(FakeProxy::new());
        let acme = Arc::new(FakeAcme::new(Arc::clone(&store), Arc::clone(&proxy), scripts));

        Self {
            dir,
            domain: Domain::new(DOMAIN, "admin@example.test"),
            store,
            proxy,
            acme,
            probe: Arc::new(FakeProbe::new()),
        }
    }

    /// Install an existing certificate valid for `days_valid` more days
    pub fn with_certificate(self, days_valid: i64) -> Self {
        let (cert, key) = test_cert(DOMAIN, days_valid);
        self.store
            .save_bundle(&self.domain.name, &cert, &key)
            .unwrap();
        self
    }

    pub fn lock(&self) -> DomainLock {
        DomainLock::new(
            &self.store.domain_path(&self.domain.name),
            PollPolicy::once(),
        )
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(settings())
    }

    pub fn orchestrator_with(&self, settings: OrchestratorSettings) -> Orchestrator {
        Orchestrator::new(
            self.domain.clone(),
            Arc::clone(&self.store),
            self.proxy.clone(),
            self.acme.clone(),
            self.probe.clone(),
            settings,
            self.lock(),
        )
    }
}
