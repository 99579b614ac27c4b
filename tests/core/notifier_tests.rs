//! End-to-end push behavior against a local capture server.

use std::time::{Duration, Instant};

use probixel::config::{load_str, GlobalConfig, MonitorEndpointConfig};
use probixel::core::{CheckResult, Notifier, PushError};
use tokio_util::sync::CancellationToken;

use crate::common::CaptureServer;

fn endpoint_cfg(success_url: &str, failure_url: Option<&str>) -> MonitorEndpointConfig {
    let raw = format!(
        r#"
global:
  default_interval: 60s
services:
  - name: svc
    type: host
    monitor_endpoint:
      success: {{ url: "{}" }}
{}
"#,
        success_url,
        failure_url
            .map(|u| format!("      failure: {{ url: \"{}\" }}", u))
            .unwrap_or_default()
    );
    load_str(&raw).unwrap().services[0].monitor_endpoint.clone()
}

#[tokio::test]
async fn url_template_is_expanded_into_the_query() {
    let server = CaptureServer::start(200).await;
    let url = server.url("/a?d={%duration%}&ok={%success%}&m={%message%}");
    let cfg = endpoint_cfg(&url, None);

    let notifier = Notifier::new().unwrap();
    notifier.set_rate_limit(Some(Duration::ZERO));
    let result = CheckResult::ok("web", Duration::from_millis(150), "Test OK");
    notifier
        .push(
            &CancellationToken::new(),
            &result,
            &cfg,
            &GlobalConfig::default(),
        )
        .await
        .unwrap();

    let targets = server.request_targets();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0], "/a?d=150&ok=true&m=Test+OK");
}

#[tokio::test]
async fn failure_selects_the_failure_endpoint() {
    let server = CaptureServer::start(200).await;
    let cfg = endpoint_cfg(&server.url("/ok"), Some(&server.url("/fail?e={%error%}")));

    let notifier = Notifier::new().unwrap();
    notifier.set_rate_limit(Some(Duration::ZERO));
    let result = CheckResult::fail("web", Duration::from_millis(3), "boom");
    notifier
        .push(
            &CancellationToken::new(),
            &result,
            &cfg,
            &GlobalConfig::default(),
        )
        .await
        .unwrap();

    assert_eq!(server.request_targets(), vec!["/fail?e=boom".to_string()]);
}

#[tokio::test]
async fn non_2xx_push_is_a_bad_status_error() {
    let server = CaptureServer::start(503).await;
    let cfg = endpoint_cfg(&server.url("/ok"), None);

    let notifier = Notifier::new().unwrap();
    notifier.set_rate_limit(Some(Duration::ZERO));
    let result = CheckResult::ok("web", Duration::from_millis(1), "fine");
    let err = notifier
        .push(
            &CancellationToken::new(),
            &result,
            &cfg,
            &GlobalConfig::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PushError::BadStatus { status: 503, .. }));
}

#[tokio::test]
async fn transport_errors_surface_as_push_transport() {
    // Connect to a port that was just released.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cfg = endpoint_cfg(&format!("http://{}/ok", addr), None);
    let notifier = Notifier::new().unwrap();
    notifier.set_rate_limit(Some(Duration::ZERO));
    let result = CheckResult::ok("web", Duration::from_millis(1), "fine");
    let err = notifier
        .push(
            &CancellationToken::new(),
            &result,
            &cfg,
            &GlobalConfig::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PushError::Transport { .. }));
}

#[tokio::test]
async fn pushes_are_spaced_by_the_rate_limit() {
    let server = CaptureServer::start(200).await;
    let cfg = endpoint_cfg(&server.url("/ok"), None);

    let notifier = Notifier::new().unwrap();
    notifier.set_rate_limit(Some(Duration::from_millis(60)));
    let result = CheckResult::ok("web", Duration::from_millis(1), "fine");

    let started = Instant::now();
    for _ in 0..3 {
        notifier
            .push(
                &CancellationToken::new(),
                &result,
                &cfg,
                &GlobalConfig::default(),
            )
            .await
            .unwrap();
    }
    // Three pushes cross the gate at least two rate-limits apart.
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(server.hits(), 3);
}
