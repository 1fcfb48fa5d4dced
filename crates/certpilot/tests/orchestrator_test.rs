//! Integration tests for the bootstrap/renewal state machine
//!
//! Drives the orchestrator against fake proxy, CA and probe implementations
//! with a real on-disk certificate store.

mod common;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use certpilot::acme::AttemptOutcome;
use certpilot::health::{HealthProbe, ProbeRequest};
use certpilot::metrics::Metrics;
use certpilot::proxy::ProxyState;
use certpilot::{RunMode, RunOutcome, RunState};
use certpilot_common::{ChallengeStrategy, PollPolicy, ProxyConfigVariant};

use common::{Harness, Script, DOMAIN};

use ChallengeStrategy::{Standalone, Webroot};
use RunState::*;

/// Probe the HTTP-only health endpoint the way an operator would after a run
async fn assert_http_only_healthy(harness: &Harness, report: &certpilot::RunReport) {
    let settings = common::settings();

    let confirmed = report.probes.last().expect("http-only confirmed by the run");
    assert_eq!(confirmed.endpoint, settings.http_health_url);
    assert_eq!(confirmed.status, 200);

    let request = ProbeRequest::new(
        settings.http_health_url.clone(),
        settings.expected_status.clone(),
        PollPolicy::once(),
    );
    let result = harness.probe.probe(&request).await.unwrap();
    assert_eq!(result.status, 200);
    assert!(harness.proxy.up());
    assert_eq!(harness.proxy.active(), ProxyConfigVariant::HttpOnly);
}

/// First bootstrap: issue and leave the proxy serving tls-redirect
async fn serving_tls(harness: &Harness) {
    let report = harness.orchestrator().run(RunMode::Bootstrap).await;
    assert_eq!(report.outcome, RunOutcome::Issued);
    assert_eq!(harness.proxy.active(), ProxyConfigVariant::TlsRedirect);
}

// ============================================================================
// Existing certificate
// ============================================================================

#[tokio::test]
async fn test_valid_certificate_skips_issuance() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]).with_certificate(60);
    let orchestrator = harness.orchestrator();

    let report = orchestrator.run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::AlreadyValid);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.path(), vec![Init, HttpOnlyUp, Validating, TlsUp]);
    assert!(harness.acme.calls().is_empty());
    assert!(report.attempts.is_empty());

    assert_eq!(harness.proxy.active(), ProxyConfigVariant::TlsRedirect);
    assert!(harness.proxy.up());
    assert!(report.certificate_expires_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    let orchestrator = harness.orchestrator();

    let first = orchestrator.run(RunMode::Bootstrap).await;
    assert_eq!(first.outcome, RunOutcome::Issued);
    let starts = harness.proxy.count("start");

    let second = orchestrator.run(RunMode::Bootstrap).await;
    assert_eq!(second.outcome, RunOutcome::AlreadyValid);
    assert_eq!(second.path(), vec![Init, Validating, TlsUp]);

    // One issuance overall, no restart of the already serving proxy
    assert_eq!(harness.acme.calls().len(), 1);
    assert_eq!(harness.proxy.count("start"), starts);

    let state = ProxyState::load(&harness.store.domain_path(&harness.domain.name));
    assert_eq!(state.variant, ProxyConfigVariant::TlsRedirect);
    assert!(state.last_reload.is_some());
}

#[tokio::test]
async fn test_renew_outside_window_is_a_no_op() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]).with_certificate(60);

    let report = harness
        .orchestrator()
        .run(RunMode::Renew { force: false })
        .await;

    assert_eq!(report.outcome, RunOutcome::AlreadyValid);
    assert!(harness.acme.calls().is_empty());
}

#[tokio::test]
async fn test_renew_inside_window_issues() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]).with_certificate(10);
    let before = harness.store.load_bundle(&harness.domain.name).unwrap().unwrap();

    let report = harness
        .orchestrator()
        .run(RunMode::Renew { force: false })
        .await;

    assert_eq!(report.outcome, RunOutcome::Issued);
    let after = harness.store.load_bundle(&harness.domain.name).unwrap().unwrap();
    assert!(after.expires_at > before.expires_at);
}

#[tokio::test]
async fn test_expired_certificate_is_replaced_on_bootstrap() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    // Valid from yesterday until this morning
    let (cert, key) = common::test_cert(DOMAIN, 0);
    harness
        .store
        .save_bundle(&harness.domain.name, &cert, &key)
        .unwrap();

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::Issued);
    assert_eq!(harness.acme.calls().len(), 1);
}

// ============================================================================
// Issuance and fallback
// ============================================================================

#[tokio::test]
async fn test_webroot_issuance_switches_to_tls() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::Issued);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        report.path(),
        vec![Init, HttpOnlyUp, Validating, IssuingWebroot, Switching, TlsUp]
    );

    // Webroot issuance happens with the proxy serving the challenge path
    assert_eq!(harness.acme.calls(), vec![(Webroot, true)]);
    assert_eq!(harness.proxy.count("stop"), 0);
    assert_eq!(harness.proxy.active(), ProxyConfigVariant::TlsRedirect);

    // Redirect and HTTPS verified after the switch
    let probed = harness.probe.probed();
    assert_eq!(
        probed,
        vec![
            format!("http://{}/health/", DOMAIN),
            format!("http://{}/", DOMAIN),
            format!("https://{}/health/", DOMAIN),
        ]
    );
}

#[tokio::test]
async fn test_webroot_failure_falls_back_to_standalone() {
    let harness = Harness::new(vec![
        (Webroot, Script::FailChallenge),
        (Standalone, Script::Succeed),
    ]);

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::Issued);
    assert_eq!(report.final_state, TlsUp);
    assert_eq!(
        report.path(),
        vec![
            Init,
            HttpOnlyUp,
            Validating,
            IssuingWebroot,
            IssuingStandalone,
            Switching,
            TlsUp
        ]
    );

    // Standalone ran with the proxy down, and the proxy came back afterwards
    assert_eq!(harness.acme.calls(), vec![(Webroot, true), (Standalone, false)]);
    assert_eq!(harness.proxy.count("stop"), 1);
    assert_eq!(harness.proxy.count("start"), 2);
    assert!(harness.proxy.up());

    let outcomes: Vec<_> = report.attempts.iter().map(|a| (a.method, a.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            (Webroot, AttemptOutcome::Failed),
            (Standalone, AttemptOutcome::Success)
        ]
    );
    assert_eq!(report.attempts[0].error_kind.as_deref(), Some("challenge_failed"));

    let history = harness
        .store
        .recent_attempts(&harness.domain.name, 10)
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].method, Standalone);
}

#[tokio::test]
async fn test_all_strategies_failing_degrades() {
    let harness = Harness::new(vec![
        (Webroot, Script::FailChallenge),
        (Standalone, Script::FailChallenge),
    ]);

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::IssuanceFailed);
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.final_state, Degraded);

    // Still serving plain HTTP
    assert_http_only_healthy(&harness, &report).await;
    assert!(harness
        .store
        .load_bundle(&harness.domain.name)
        .unwrap()
        .is_none());
    assert_eq!(report.attempts.len(), 2);
}

#[tokio::test]
async fn test_non_retryable_error_stops_fallback() {
    let harness = Harness::new(vec![
        (Webroot, Script::FailAccount),
        (Standalone, Script::Succeed),
    ]);

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::IssuanceFailed);
    assert_eq!(harness.acme.calls(), vec![(Webroot, true)]);
    assert_eq!(harness.proxy.count("stop"), 0);
}

#[tokio::test]
async fn test_configured_order_is_respected() {
    let harness = Harness::new(vec![(Standalone, Script::Succeed)]);
    let mut settings = common::settings();
    settings.strategies = vec![Standalone];

    let report = harness
        .orchestrator_with(settings)
        .run(RunMode::Bootstrap)
        .await;

    assert_eq!(report.outcome, RunOutcome::Issued);
    assert_eq!(harness.acme.calls(), vec![(Standalone, false)]);
}

#[tokio::test]
async fn test_standalone_attempt_keeps_its_start_time_when_restart_fails() {
    let harness = Harness::new(vec![(Standalone, Script::Succeed)]);
    let mut settings = common::settings();
    settings.strategies = vec![Standalone];
    let orchestrator = harness.orchestrator_with(settings);

    // Up once for the bootstrap, then every start fails
    let first = orchestrator.run(RunMode::Bootstrap).await;
    assert_eq!(first.outcome, RunOutcome::Issued);
    harness.proxy.fail_starts();

    let report = orchestrator.run(RunMode::Renew { force: true }).await;

    assert_eq!(report.outcome, RunOutcome::ProxyFailed);
    assert_eq!(report.final_state, Failed);
    let attempt = report.attempts.last().unwrap();
    assert_eq!(attempt.method, Standalone);
    assert_eq!(attempt.outcome, AttemptOutcome::Success);
    assert!(attempt.started_at >= report.started_at);
    assert!(attempt.started_at <= report.transitions.last().unwrap().at);
    let issuing_at = report
        .transitions
        .iter()
        .find(|t| t.to == IssuingStandalone)
        .unwrap()
        .at;
    assert!(attempt.started_at >= issuing_at);
}

// ============================================================================
// Proxy already serving TLS
// ============================================================================

#[tokio::test]
async fn test_expired_certificate_behind_tls_proxy_is_reissued() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    serving_tls(&harness).await;

    // Valid from yesterday until this morning
    let (cert, key) = common::test_cert(DOMAIN, 0);
    harness
        .store
        .save_bundle(&harness.domain.name, &cert, &key)
        .unwrap();

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::Issued);
    assert_eq!(
        report.path(),
        vec![Init, HttpOnlyUp, Validating, IssuingWebroot, Switching, TlsUp]
    );
    assert_eq!(harness.acme.calls().len(), 2);
    assert_eq!(harness.proxy.active(), ProxyConfigVariant::TlsRedirect);

    // The pre-issuance gate went over HTTP
    assert_eq!(report.probes[0].endpoint, common::settings().http_health_url);
}

#[tokio::test]
async fn test_expired_certificate_with_failing_https_still_reaches_issuance() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    serving_tls(&harness).await;

    let (cert, key) = common::test_cert(DOMAIN, 0);
    harness
        .store
        .save_bundle(&harness.domain.name, &cert, &key)
        .unwrap();
    harness.probe.fail("https://");

    for mode in [RunMode::Bootstrap, RunMode::Renew { force: true }] {
        let report = harness.orchestrator().run(mode).await;
        assert!(report.path().contains(&IssuingWebroot), "{:?}", report.path());
        assert_ne!(report.path()[1], Validating);
    }
    assert_eq!(harness.acme.calls().len(), 3);
}

#[tokio::test]
async fn test_removed_certificate_behind_tls_proxy_is_reissued() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    serving_tls(&harness).await;
    harness.store.remove_bundle(&harness.domain.name).unwrap();

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::Issued);
    assert_eq!(report.path()[1], HttpOnlyUp);
    // Once to start the first run, once to fall back from tls-redirect
    assert_eq!(harness.proxy.count("select http-only"), 2);
}

#[tokio::test]
async fn test_forced_renewal_with_failing_https_falls_back_to_http() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    serving_tls(&harness).await;
    harness.probe.fail("https://");

    let report = harness
        .orchestrator()
        .run(RunMode::Renew { force: true })
        .await;

    assert_eq!(
        report.path(),
        vec![
            Init,
            Validating,
            HttpOnlyUp,
            Validating,
            IssuingWebroot,
            Switching,
            Degraded
        ]
    );
    assert_eq!(report.outcome, RunOutcome::HealthCheckFailed);
    assert_eq!(harness.acme.calls().len(), 2);
    assert_http_only_healthy(&harness, &report).await;
}

#[tokio::test]
async fn test_failing_https_without_renewal_due_keeps_tls() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    serving_tls(&harness).await;
    harness.probe.fail("https://");

    let report = harness
        .orchestrator()
        .run(RunMode::Renew { force: false })
        .await;

    assert_eq!(report.outcome, RunOutcome::HealthCheckFailed);
    assert_eq!(report.path(), vec![Init, Validating, Failed]);
    assert_eq!(harness.acme.calls().len(), 1);
    assert_eq!(harness.proxy.active(), ProxyConfigVariant::TlsRedirect);
}

#[tokio::test]
async fn test_corrupt_metadata_costs_one_issuance_only() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    serving_tls(&harness).await;

    let meta = harness
        .store
        .domain_path(&harness.domain.name)
        .join("meta.json");
    std::fs::write(&meta, "{ not json").unwrap();

    let repaired = harness.orchestrator().run(RunMode::Bootstrap).await;
    assert_eq!(repaired.outcome, RunOutcome::Issued);
    assert_eq!(repaired.attempts[0].outcome, AttemptOutcome::Success);
    assert!(harness
        .store
        .load_bundle(&harness.domain.name)
        .unwrap()
        .is_some());

    let next = harness.orchestrator().run(RunMode::Bootstrap).await;
    assert_eq!(next.outcome, RunOutcome::AlreadyValid);
    assert_eq!(harness.acme.calls().len(), 2);
}

// ============================================================================
// Proxy and health failures
// ============================================================================

#[tokio::test]
async fn test_rejected_tls_config_keeps_http_only() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    harness.proxy.reject(ProxyConfigVariant::TlsRedirect);

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::ProxyFailed);
    assert_eq!(report.exit_code(), 5);
    assert_eq!(report.final_state, Degraded);
    assert_http_only_healthy(&harness, &report).await;
    assert_eq!(harness.proxy.count("reload"), 0);

    // The certificate is kept for the next run
    assert!(harness
        .store
        .load_bundle(&harness.domain.name)
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_https_failure_rolls_back_to_http_only() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    harness.probe.fail("https://");

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::HealthCheckFailed);
    assert_eq!(report.exit_code(), 4);
    assert_eq!(report.final_state, Degraded);
    assert_eq!(harness.proxy.active(), ProxyConfigVariant::HttpOnly);
    assert_eq!(harness.proxy.count("reload"), 2);

    let state = ProxyState::load(&harness.store.domain_path(&harness.domain.name));
    assert_eq!(state.variant, ProxyConfigVariant::HttpOnly);
}

#[tokio::test]
async fn test_unhealthy_endpoint_blocks_issuance() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    harness.probe.fail("http://");

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::HealthCheckFailed);
    assert_eq!(report.final_state, Failed);
    assert_eq!(report.path(), vec![Init, HttpOnlyUp, Validating, Failed]);
    assert!(harness.acme.calls().is_empty());
}

#[tokio::test]
async fn test_proxy_start_failure() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    harness.proxy.fail_starts();

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::ProxyFailed);
    assert_eq!(report.path(), vec![Init, Failed]);
    assert!(harness.acme.calls().is_empty());
    assert!(harness.probe.probed().is_empty());
}

// ============================================================================
// Lock, cancellation, metrics
// ============================================================================

#[tokio::test]
async fn test_concurrent_run_is_busy() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    let _held = harness.lock().try_acquire().unwrap().expect("lock free");

    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    assert_eq!(report.outcome, RunOutcome::Busy);
    assert_eq!(report.exit_code(), 6);
    assert!(report.transitions.is_empty());
    assert!(harness.proxy.calls().is_empty());
}

#[tokio::test]
async fn test_shutdown_interrupts_before_issuance() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = harness
        .orchestrator()
        .with_cancellation(cancel)
        .run(RunMode::Bootstrap)
        .await;

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.exit_code(), 7);
    assert_eq!(report.final_state, HttpOnlyUp);
    assert!(harness.acme.calls().is_empty());
}

#[tokio::test]
async fn test_metrics_textfile_written_after_run() {
    let harness = Harness::new(vec![
        (Webroot, Script::FailChallenge),
        (Standalone, Script::Succeed),
    ]);
    let textfile = harness.dir.path().join("metrics").join("certpilot.prom");
    let metrics = Arc::new(Metrics::new().unwrap());

    let report = harness
        .orchestrator()
        .with_metrics(Arc::clone(&metrics), Some(textfile.clone()))
        .run(RunMode::Bootstrap)
        .await;
    assert_eq!(report.outcome, RunOutcome::Issued);

    let content = std::fs::read_to_string(&textfile).unwrap();
    assert!(content.contains("certpilot_runs_total{outcome=\"issued\"} 1"));
    assert!(content.contains(
        "certpilot_issuance_attempts_total{method=\"webroot\",outcome=\"failed\"} 1"
    ));
    assert!(content.contains(
        "certpilot_state_transitions_total{from=\"switching\",to=\"tls_up\"} 1"
    ));
}

#[tokio::test]
async fn test_report_serializes() {
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);
    let report = harness.orchestrator().run(RunMode::Bootstrap).await;

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["domain"], DOMAIN);
    assert_eq!(json["final_state"], "tls_up");
    assert_eq!(json["transitions"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_settings_from_default_config() {
    let config = certpilot_config::Config::default_for_testing();
    let settings = certpilot::OrchestratorSettings::from_config(&config).unwrap();
    let harness = Harness::new(vec![(Webroot, Script::Succeed)]);

    let report = harness
        .orchestrator_with(settings)
        .run(RunMode::Bootstrap)
        .await;

    assert_eq!(report.outcome, RunOutcome::Issued);
    assert_eq!(
        harness.probe.probed(),
        vec![
            "http://example.test/health/".to_string(),
            "http://example.test/".to_string(),
            "https://example.test/health/".to_string(),
        ]
    );
    assert!(report.probes[1]
        .location
        .as_deref()
        .unwrap()
        .starts_with("https://example.test"));
}
