//! UDP probe: socket creation plus a zero-length datagram.
//!
//! UDP is connectionless, so this validates local socket setup and the
//! route; a dead remote port is not detectable here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::TargetMode;
use crate::core::error::ProbeError;
use crate::core::result::CheckResult;
use crate::core::tunnel::{Tunnel, WireguardTunnel};

use super::{cancellable, fan_out, tunnel_gate, Probe};

pub struct UdpProbe {
    timeout: Duration,
    mode: TargetMode,
    tunnel: Option<Arc<dyn Tunnel>>,
}

impl UdpProbe {
    pub fn new() -> Self {
        Self {
            timeout: crate::config::DEFAULT_TIMEOUT,
            mode: TargetMode::Any,
            tunnel: None,
        }
    }

    async fn check_one(&self, entry: String) -> Result<CheckResult, ProbeError> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.send_datagram(&entry)).await;
        match outcome {
            Ok(Ok(())) => Ok(CheckResult::ok(&entry, started.elapsed(), "datagram sent")),
            Ok(Err(message)) => Ok(CheckResult::fail(&entry, started.elapsed(), message)),
            Err(_) => Ok(CheckResult::fail(
                &entry,
                started.elapsed(),
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }

    async fn send_datagram(&self, entry: &str) -> Result<(), String> {
        if let Some(tunnel) = self.tunnel.as_ref() {
            // Only the wireguard stack can carry datagrams.
            let Some(wg) = tunnel.as_any().downcast_ref::<WireguardTunnel>() else {
                return Err(format!(
                    "tunnel {} cannot carry udp datagrams",
                    tunnel.name()
                ));
            };
            return wg
                .send_udp_datagram(entry, &[])
                .await
                .map_err(|e| e.to_string());
        }

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| format!("bind: {}", e))?;
        socket
            .connect(entry)
            .await
            .map_err(|e| format!("dial: {}", e))?;
        socket.send(&[]).await.map_err(|e| format!("send: {}", e))?;
        Ok(())
    }
}

impl Default for UdpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for UdpProbe {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn check(
        &self,
        ctx: &CancellationToken,
        target: &str,
    ) -> Result<CheckResult, ProbeError> {
        if let Some(pending) = tunnel_gate(self.tunnel.as_ref(), target).await {
            return Ok(pending);
        }
        let work = fan_out(target, self.mode, |entry| self.check_one(entry));
        match cancellable(ctx, target, work).await {
            Ok(result) => result,
            Err(interrupted) => Ok(interrupted),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn set_target_mode(&mut self, mode: TargetMode) {
        self.mode = mode;
    }

    fn set_tunnel(&mut self, tunnel: Arc<dyn Tunnel>) {
        self.tunnel = Some(tunnel);
    }
}
