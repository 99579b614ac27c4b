//! WireGuard heartbeat probe.
//!
//! Judges tunnel liveness purely from the device's last-handshake
//! clock: no handshake inside the stabilization window is pending, no
//! handshake after it is a failure, and a stale handshake older than
//! `max_age` is a failure. Failures feed the tunnel's restart logic.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::WireguardConfig;
use crate::core::error::ProbeError;
use crate::core::result::CheckResult;
use crate::core::tunnel::{Tunnel, WireguardTunnel, STABILIZATION_WINDOW};

use super::Probe;

pub struct WireguardProbe {
    max_age: Duration,
    /// Inline config for the ephemeral-tunnel form.
    inline: Option<WireguardConfig>,
    tunnel: Option<Arc<dyn Tunnel>>,
}

impl WireguardProbe {
    pub fn new(max_age: Duration, inline: Option<WireguardConfig>) -> Self {
        Self {
            max_age,
            inline,
            tunnel: None,
        }
    }

    fn tunnel(&self) -> Result<&Arc<dyn Tunnel>, ProbeError> {
        self.tunnel.as_ref().ok_or_else(|| {
            ProbeError::Misconfigured("wireguard probe without a tunnel".to_string())
        })
    }
}

#[async_trait]
impl Probe for WireguardProbe {
    fn name(&self) -> &'static str {
        "wireguard"
    }

    /// The ephemeral form owns its tunnel; build and start it here.
    async fn initialize(&mut self) -> Result<(), ProbeError> {
        if self.tunnel.is_some() {
            return Ok(());
        }
        let Some(config) = self.inline.clone() else {
            return Ok(());
        };
        let tunnel: Arc<dyn Tunnel> =
            Arc::new(WireguardTunnel::new("inline".to_string(), config));
        if let Err(e) = tunnel.initialize().await {
            // Same policy as the watchdog: an unhealthy tunnel stays
            // around and reports pending until it comes up.
            tracing::warn!("inline wireguard tunnel failed to initialize: {}", e);
        }
        self.tunnel = Some(tunnel);
        Ok(())
    }

    async fn check(
        &self,
        _ctx: &CancellationToken,
        target: &str,
    ) -> Result<CheckResult, ProbeError> {
        let started = Instant::now();
        let tunnel = self.tunnel()?;
        let label = if target.is_empty() {
            tunnel.name().to_string()
        } else {
            target.to_string()
        };

        // Nudge a torn-down device back up; idempotent when live.
        if let Err(e) = tunnel.initialize().await {
            return Ok(CheckResult::fail(
                &label,
                started.elapsed(),
                format!("tunnel initialization failed: {}", e),
            ));
        }

        let within_window = tunnel
            .last_init_time()
            .map_or(true, |t| t.elapsed() < STABILIZATION_WINDOW);

        match tunnel.last_handshake() {
            None if within_window => Ok(CheckResult::pending(&label, "waiting for handshake")),
            None => {
                tunnel.report_failure().await;
                Ok(CheckResult::fail(
                    &label,
                    started.elapsed(),
                    "no handshake completed",
                ))
            }
            Some(at) => {
                let age = SystemTime::now()
                    .duration_since(at)
                    .unwrap_or(Duration::ZERO);
                if age > self.max_age {
                    tunnel.report_failure().await;
                    return Ok(CheckResult::fail(
                        &label,
                        started.elapsed(),
                        format!("handshake stale ({}s old)", age.as_secs()),
                    ));
                }
                tunnel.report_success();
                Ok(CheckResult::ok(
                    &label,
                    started.elapsed(),
                    format!("last handshake {}s ago", age.as_secs()),
                ))
            }
        }
    }

    /// Heartbeats read device state only; no I/O to bound.
    fn set_timeout(&mut self, _timeout: Duration) {}

    fn set_tunnel(&mut self, tunnel: Arc<dyn Tunnel>) {
        self.tunnel = Some(tunnel);
    }
}
