//! Hot reload behavior: invalid files keep the old snapshot, valid
//! files swap it and rebuild the monitor plane.

use std::sync::Arc;
use std::time::Duration;

use probixel::config::{load_str, ConfigState};
use probixel::core::{Notifier, Watchdog};
use serial_test::serial;
use tokio_util::sync::CancellationToken;

use crate::common::CaptureServer;

fn agent_config(push_ok: &str, interval: &str) -> String {
    format!(
        r#"
global:
  reload_delay: 200ms
services:
  - name: beat
    type: host
    interval: {interval}
    timeout: 50ms
    monitor_endpoint:
      success: {{ url: "{push_ok}" }}
"#,
    )
}

async fn start_watchdog(
    dir: &tempfile::TempDir,
    content: &str,
) -> (
    std::path::PathBuf,
    Arc<ConfigState>,
    CancellationToken,
    tokio::task::JoinHandle<()>,
) {
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, content).unwrap();

    let state = Arc::new(ConfigState::new(load_str(content).unwrap()));
    let notifier = Arc::new(Notifier::new().unwrap());
    notifier.set_rate_limit(Some(Duration::ZERO));

    let watchdog = Watchdog::new(path.clone(), state.clone(), notifier, Duration::ZERO);
    let ctx = CancellationToken::new();
    let task_ctx = ctx.clone();
    let handle = tokio::spawn(async move { watchdog.start(task_ctx).await });
    (path, state, ctx, handle)
}

#[tokio::test]
#[serial]
async fn invalid_reload_keeps_previous_snapshot() {
    let push = CaptureServer::start(204).await;
    let dir = tempfile::tempdir().unwrap();
    let content = agent_config(&push.url("/ok"), "500ms");
    let (path, state, ctx, handle) = start_watchdog(&dir, &content).await;

    // The plane is up and pushing.
    assert!(push.wait_for_hits(1, Duration::from_secs(5)).await);
    let before = state.get();

    std::fs::write(&path, "services: [ this is not yaml ::::\n").unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    // Old snapshot retained, monitors still running.
    let after = state.get();
    assert!(Arc::ptr_eq(&before, &after), "snapshot must be unchanged");
    let hits = push.hits();
    assert!(push.wait_for_hits(hits + 1, Duration::from_secs(5)).await);

    ctx.cancel();
    let _ = handle.await;
}

#[tokio::test]
#[serial]
async fn valid_reload_publishes_new_snapshot() {
    let push = CaptureServer::start(204).await;
    let dir = tempfile::tempdir().unwrap();
    let content = agent_config(&push.url("/ok"), "500ms");
    let (path, state, ctx, handle) = start_watchdog(&dir, &content).await;

    assert!(push.wait_for_hits(1, Duration::from_secs(5)).await);

    let updated = agent_config(&push.url("/ok"), "400ms");
    std::fs::write(&path, &updated).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = state.get();
        let svc = snapshot.service("beat").unwrap();
        if snapshot.effective_interval(svc) == Duration::from_millis(400) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reload never published the new snapshot"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The rebuilt plane keeps pushing.
    let hits = push.hits();
    assert!(push.wait_for_hits(hits + 1, Duration::from_secs(5)).await);

    ctx.cancel();
    let _ = handle.await;
}
