//! Tunnel stabilization gating and restart suppression, using a real
//! userspace WireGuard tunnel whose peer never answers.

use std::sync::Arc;
use std::time::Duration;

use probixel::config::{HttpOptions, WireguardConfig};
use probixel::core::probe::{HttpProbe, Probe};
use probixel::core::tunnel::WireguardTunnel;
use probixel::core::Tunnel;
use tokio_util::sync::CancellationToken;

use crate::common::{wireguard_keypair, CaptureServer};

fn tunnel_config() -> WireguardConfig {
    let (private, _) = wireguard_keypair();
    let (_, peer_public) = wireguard_keypair();
    WireguardConfig {
        // A local UDP port nobody answers on: handshakes never finish.
        endpoint: Some("127.0.0.1:59999".to_string()),
        public_key: Some(peer_public),
        private_key: Some(private),
        addresses: vec!["10.99.0.2/24".to_string()],
        ..WireguardConfig::default()
    }
}

/// A probe attached to a freshly initialized tunnel must return pending
/// without performing any I/O.
#[tokio::test]
async fn fresh_tunnel_gates_probes_to_pending() {
    let server = CaptureServer::start(200).await;
    let tunnel: Arc<dyn Tunnel> =
        Arc::new(WireguardTunnel::new("wg-test".to_string(), tunnel_config()));
    tunnel.initialize().await.unwrap();
    assert!(!tunnel.is_stabilized(), "20s stabilization window applies");

    let mut probe = HttpProbe::new(&HttpOptions::default()).unwrap();
    probe.set_timeout(Duration::from_secs(1));
    probe.set_tunnel(tunnel.clone());

    let result = probe
        .check(&CancellationToken::new(), &server.url("/"))
        .await
        .unwrap();

    assert!(result.pending);
    assert!(!result.success);
    assert!(result.message.contains("wg-test"));
    assert_eq!(server.hits(), 0, "no request may be issued while pending");

    tunnel.stop().await;
}

/// A failure report inside the success window leaves the device alive.
#[tokio::test]
async fn recent_success_suppresses_restart() {
    let tunnel = WireguardTunnel::new("wg-test".to_string(), tunnel_config());
    tunnel.initialize().await.unwrap();
    tunnel.set_success_window(Duration::from_secs(60));
    tunnel.report_success();

    tunnel.report_failure().await;

    // Still initialized: init time survives and a later initialize is
    // the idempotent no-op.
    assert!(tunnel.last_init_time().is_some());
    tunnel.initialize().await.unwrap();
    assert!(tunnel.last_init_time().is_some());

    tunnel.stop().await;
}

/// Without any recent sign of life the report tears the device down
/// and resets the init time, so the next epoch re-initializes.
#[tokio::test]
async fn unhealthy_tunnel_is_torn_down() {
    let tunnel = WireguardTunnel::new("wg-test".to_string(), tunnel_config());
    tunnel.initialize().await.unwrap();
    tunnel.set_success_window(Duration::ZERO);

    tunnel.report_failure().await;
    assert!(tunnel.last_init_time().is_none());
    assert!(!tunnel.is_stabilized());

    // Next use brings it back up.
    tunnel.initialize().await.unwrap();
    assert!(tunnel.last_init_time().is_some());
    tunnel.stop().await;
}

#[tokio::test]
async fn stop_all_registry_stops_wireguard_tunnels() {
    let registry = probixel::core::TunnelRegistry::new();
    let tunnel = Arc::new(WireguardTunnel::new("wg-a".to_string(), tunnel_config()));
    tunnel.initialize().await.unwrap();
    registry.register(tunnel.clone()).unwrap();

    registry.stop_all().await;
    assert!(registry.get("wg-a").is_none());
    assert!(tunnel.last_init_time().is_none());
}
