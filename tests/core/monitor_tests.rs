//! Retry policy and push accounting, end to end through the monitor.

use std::sync::Arc;
use std::time::Duration;

use probixel::config::{load_str, ConfigState};
use probixel::core::{setup_probe, Notifier, ServiceMonitor, TunnelRegistry};
use tokio_util::sync::CancellationToken;

use crate::common::CaptureServer;

/// A service with retries 2 against a target answering 500 three times
/// performs exactly three checks and one failure push.
#[tokio::test]
async fn failing_http_service_retries_then_pushes_failure_once() {
    let target = CaptureServer::start(500).await;
    let push = CaptureServer::start(204).await;

    let raw = format!(
        r#"
services:
  - name: flaky
    type: http
    url: "{target}"
    interval: 10s
    timeout: 1s
    retries: 2
    monitor_endpoint:
      success: {{ url: "{ok}" }}
      failure: {{ url: "{fail}" }}
"#,
        target = target.url("/probe"),
        ok = push.url("/ok"),
        fail = push.url("/fail"),
    );
    let state = Arc::new(ConfigState::new(load_str(&raw).unwrap()));
    let registry = Arc::new(TunnelRegistry::new());
    let notifier = Arc::new(Notifier::new().unwrap());
    notifier.set_rate_limit(Some(Duration::ZERO));

    let snapshot = state.get();
    let probe = setup_probe(&snapshot, &snapshot.services[0], &registry)
        .await
        .unwrap();
    let monitor = ServiceMonitor::new(
        "flaky".to_string(),
        Arc::from(probe),
        state,
        registry,
        notifier,
    );

    let ctx = CancellationToken::new();
    let handle = tokio::spawn(monitor.run(ctx.clone()));

    assert!(push.wait_for_hits(1, Duration::from_secs(5)).await);
    // Give a grace period to catch spurious extra pushes or checks.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(target.hits(), 3, "expected exactly retries+1 checks");
    assert_eq!(push.hits(), 1, "expected exactly one notification");
    assert_eq!(push.request_targets(), vec!["/fail".to_string()]);

    ctx.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn healthy_http_service_pushes_success_once_per_tick() {
    let target = CaptureServer::start(200).await;
    let push = CaptureServer::start(204).await;

    let raw = format!(
        r#"
services:
  - name: steady
    type: http
    url: "{target}"
    interval: 10s
    timeout: 1s
    retries: 3
    monitor_endpoint:
      success: {{ url: "{ok}" }}
      failure: {{ url: "{fail}" }}
"#,
        target = target.url("/probe"),
        ok = push.url("/ok"),
        fail = push.url("/fail"),
    );
    let state = Arc::new(ConfigState::new(load_str(&raw).unwrap()));
    let registry = Arc::new(TunnelRegistry::new());
    let notifier = Arc::new(Notifier::new().unwrap());
    notifier.set_rate_limit(Some(Duration::ZERO));

    let snapshot = state.get();
    let probe = setup_probe(&snapshot, &snapshot.services[0], &registry)
        .await
        .unwrap();
    let monitor = ServiceMonitor::new(
        "steady".to_string(),
        Arc::from(probe),
        state,
        registry,
        notifier,
    );

    let ctx = CancellationToken::new();
    let handle = tokio::spawn(monitor.run(ctx.clone()));

    assert!(push.wait_for_hits(1, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Success on the first attempt: one check, one success push.
    assert_eq!(target.hits(), 1);
    assert_eq!(push.request_targets(), vec!["/ok".to_string()]);

    ctx.cancel();
    let _ = handle.await;
}
