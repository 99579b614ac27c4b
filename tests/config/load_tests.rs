//! Full-file configuration parsing.

use std::time::Duration;

use probixel::config::{self, ConfigError, ServiceKind, TargetMode, TunnelKind};

const FULL: &str = r#"
global:
  default_interval: 60s
  monitor_endpoint:
    headers:
      authorization: Bearer push-token
    timeout: 10s
  notifier:
    rate_limit: 250ms
  monitor:
    retries: 2
  reload_delay: 1s

docker-sockets:
  local:
    socket: /var/run/docker.sock
  remote:
    host: 10.9.0.4
    port: 2375

tunnels:
  jump:
    type: ssh
    target: bastion.internal:2222
    ssh:
      user: probe
      password: hunter2
  site:
    type: wireguard
    wireguard:
      endpoint: vpn.example.com:51820
      public_key: mgIJKinYS6mV7bLLWkMGIka8lW1the0rnR0setW5DFI=
      private_key: QCrWieattMSXpDNm9fHaPDM/a0i6lvUnv3lHY6SyXEM=
      addresses: [10.9.0.2/24]
      persistent_keepalive: 25s
      max_age: 5m
      restart_threshold: 2

services:
  - name: website
    type: http
    url: https://example.com/health
    interval: 30s
    timeout: 3s
    http:
      method: GET
      accepted_status_codes: ["200-204"]
      match_data:
        - type: json
          selector: status
          op: "=="
          value: ok
      expiry_threshold: 14d
    monitor_endpoint:
      success:
        url: "https://push.example.com/ok?d={%duration%}"
      failure:
        url: "https://push.example.com/fail?e={%error%}"
        method: POST
  - name: db
    type: tcp
    targets: [db1:5432, db2:5432]
    target_mode: all
    tunnel: site
    monitor_endpoint:
      success: { url: "https://push.example.com/ok" }
  - name: vpn
    type: wireguard
    tunnel: site
    wireguard:
      max_age: 5m
    monitor_endpoint:
      success: { url: "https://push.example.com/ok" }
  - name: containers
    type: docker
    targets: [app, worker]
    docker:
      socket: remote
      healthy: true
    tunnel: site
    monitor_endpoint:
      success: { url: "https://push.example.com/ok" }
"#;

#[test]
fn full_config_parses_and_validates() {
    let cfg = config::load_str(FULL).unwrap();

    assert_eq!(cfg.global.default_interval, Some(Duration::from_secs(60)));
    assert_eq!(cfg.notifier_rate_limit(), Some(Duration::from_millis(250)));
    assert_eq!(cfg.reload_delay(), Duration::from_secs(1));
    assert_eq!(cfg.global.monitor.retries, Some(2));

    assert_eq!(cfg.docker_sockets.len(), 2);
    assert!(cfg.docker_sockets["local"].is_unix());
    assert_eq!(
        cfg.docker_sockets["remote"].tcp_addr().as_deref(),
        Some("10.9.0.4:2375")
    );

    assert_eq!(cfg.tunnels["jump"].kind, TunnelKind::Ssh);
    assert_eq!(cfg.tunnels["site"].kind, TunnelKind::Wireguard);
    let wg = cfg.tunnels["site"].wireguard.as_ref().unwrap();
    assert_eq!(wg.keepalive(), Duration::from_secs(25));
    assert_eq!(wg.restart_threshold, Some(2));

    assert_eq!(cfg.services.len(), 4);
    let website = cfg.service("website").unwrap();
    assert_eq!(website.kind, ServiceKind::Http);
    assert_eq!(cfg.effective_interval(website), Duration::from_secs(30));
    assert_eq!(cfg.effective_timeout(website), Duration::from_secs(3));
    assert_eq!(cfg.effective_retries(website), 2);
    assert_eq!(website.resolved_target(), "https://example.com/health");

    let db = cfg.service("db").unwrap();
    assert_eq!(db.target_mode, TargetMode::All);
    assert_eq!(db.resolved_target(), "db1:5432,db2:5432");

    // host/wireguard services never retry.
    let vpn = cfg.service("vpn").unwrap();
    assert_eq!(cfg.effective_retries(vpn), 0);
}

#[test]
fn wireguard_service_rejects_non_wireguard_tunnel() {
    let raw = FULL.replace("  - name: vpn\n    type: wireguard\n    tunnel: site", "  - name: vpn\n    type: wireguard\n    tunnel: jump");
    assert!(matches!(
        config::load_str(&raw),
        Err(ConfigError::WireguardTunnelKindMismatch { .. })
    ));
}

#[test]
fn unknown_fields_are_rejected() {
    let raw = "globall:\n  default_interval: 60s\nservices: []\n";
    assert!(matches!(config::load_str(raw), Err(ConfigError::Parse(_))));
}

#[test]
fn duration_canonical_round_trip() {
    for canonical in ["45s", "10m", "6h", "30d"] {
        let parsed = config::parse_duration(canonical).unwrap();
        assert_eq!(config::format_duration(parsed), canonical);
    }
    assert_eq!(config::parse_duration("").unwrap(), Duration::ZERO);
    assert_eq!(config::parse_duration("0").unwrap(), Duration::ZERO);
}
