//! Wires a service spec into a ready-to-run probe.

use std::sync::Arc;

use crate::config::{Config, ServiceKind, ServiceSpec};

use super::dial::DialFn;
use super::error::ProbeError;
use super::probe::{
    DnsProbe, DockerProbe, HostProbe, HttpProbe, PingProbe, Probe, SshProbe, TcpProbe, TlsProbe,
    UdpProbe, WireguardProbe,
};
use super::tunnel::{Tunnel, TunnelRegistry};

/// Build, configure, and initialize the probe for one service.
pub async fn setup_probe(
    cfg: &Config,
    svc: &ServiceSpec,
    registry: &TunnelRegistry,
) -> Result<Box<dyn Probe>, ProbeError> {
    let mut probe: Box<dyn Probe> = match svc.kind {
        ServiceKind::Http => {
            let options = svc.http.clone().unwrap_or_default();
            Box::new(HttpProbe::new(&options)?)
        }
        ServiceKind::Tcp => Box::new(TcpProbe::new()),
        ServiceKind::Udp => Box::new(UdpProbe::new()),
        ServiceKind::Dns => {
            let domain = svc
                .dns
                .clone()
                .unwrap_or_default()
                .domain()
                .to_string();
            Box::new(DnsProbe::new(domain))
        }
        ServiceKind::Ping => Box::new(PingProbe::new()),
        ServiceKind::Host => Box::new(HostProbe),
        ServiceKind::Tls => {
            let options = svc.tls.clone().unwrap_or_default();
            let expiry = options.certificate_expiry.ok_or_else(|| {
                ProbeError::Misconfigured("tls service without certificate_expiry".to_string())
            })?;
            Box::new(TlsProbe::new(expiry, options.insecure_skip_verify))
        }
        ServiceKind::Ssh => Box::new(SshProbe::new(svc.ssh.clone().unwrap_or_default())),
        ServiceKind::Docker => {
            let socket_name = svc
                .docker
                .as_ref()
                .and_then(|d| d.socket.as_deref())
                .ok_or_else(|| {
                    ProbeError::Misconfigured("docker service without a socket".to_string())
                })?;
            let socket = cfg.docker_sockets.get(socket_name).ok_or_else(|| {
                ProbeError::Misconfigured(format!("unknown docker socket {:?}", socket_name))
            })?;
            let healthy = svc.docker.as_ref().map_or(false, |d| d.healthy);
            Box::new(DockerProbe::new(socket.clone(), healthy))
        }
        ServiceKind::Wireguard => {
            let wg = svc.wireguard.clone().ok_or_else(|| {
                ProbeError::Misconfigured("wireguard service without a wireguard block".to_string())
            })?;
            let max_age = wg.max_age.ok_or_else(|| {
                ProbeError::Misconfigured("wireguard service without max_age".to_string())
            })?;
            // Inline config only when no root tunnel is referenced.
            let inline = if svc.tunnel.is_none() { Some(wg) } else { None };
            Box::new(WireguardProbe::new(max_age, inline))
        }
    };

    probe.set_timeout(cfg.effective_timeout(svc));

    if let Some(tunnel_name) = svc.tunnel.as_deref() {
        let tunnel = registry.get(tunnel_name).ok_or_else(|| {
            ProbeError::Misconfigured(format!("tunnel {:?} is not registered", tunnel_name))
        })?;
        probe.set_dialer(tunnel_dialer(tunnel.clone()));
        probe.set_tunnel(tunnel);
    }

    probe.initialize().await?;
    probe.set_target_mode(svc.target_mode);
    Ok(probe)
}

/// Dialer closure over a tunnel. A dial error on a stabilized tunnel
/// counts as a failure report; unsupported-network refusals do not.
pub fn tunnel_dialer(tunnel: Arc<dyn Tunnel>) -> DialFn {
    Arc::new(move |network: &str, addr: &str| {
        let tunnel = tunnel.clone();
        let network = network.to_string();
        let addr = addr.to_string();
        Box::pin(async move {
            match tunnel.dial(&network, &addr).await {
                Ok(stream) => Ok(stream),
                Err(e) => {
                    if !e.is_unsupported_network() && tunnel.is_stabilized() {
                        tunnel.report_failure().await;
                    }
                    Err(e)
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_str;

    const BASE: &str = r#"
global:
  default_interval: 60s
docker-sockets:
  local:
    socket: /var/run/docker.sock
services:
  - name: web
    type: http
    url: http://example.com/
    monitor_endpoint:
      success: { url: "http://push/ok" }
  - name: cache
    type: tcp
    target: cache:6379
    monitor_endpoint:
      success: { url: "http://push/ok" }
  - name: containers
    type: docker
    targets: [app, worker]
    docker: { socket: local }
    monitor_endpoint:
      success: { url: "http://push/ok" }
  - name: beat
    type: host
    monitor_endpoint:
      success: { url: "http://push/ok" }
"#;

    #[tokio::test]
    async fn builds_probes_for_each_kind() {
        let cfg = load_str(BASE).unwrap();
        let registry = TunnelRegistry::new();
        for svc in &cfg.services {
            let probe = setup_probe(&cfg, svc, &registry).await.unwrap();
            assert_eq!(probe.name(), svc.kind.to_string());
        }
    }

    #[tokio::test]
    async fn unknown_tunnel_reference_fails() {
        let cfg = load_str(BASE).unwrap();
        let mut svc = cfg.services[1].clone();
        svc.tunnel = Some("ghost".to_string());
        let registry = TunnelRegistry::new();
        let err = match setup_probe(&cfg, &svc, &registry).await {
            Ok(_) => panic!("expected setup_probe to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, ProbeError::Misconfigured(_)));
    }
}
