//! TCP connect probe: success is an accepted connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::TargetMode;
use crate::core::dial::DialFn;
use crate::core::error::ProbeError;
use crate::core::result::CheckResult;
use crate::core::tunnel::Tunnel;

use super::{cancellable, dial_stream, fan_out, tunnel_gate, Probe};

pub struct TcpProbe {
    timeout: Duration,
    mode: TargetMode,
    tunnel: Option<Arc<dyn Tunnel>>,
    dialer: Option<DialFn>,
}

impl TcpProbe {
    pub fn new() -> Self {
        Self {
            timeout: crate::config::DEFAULT_TIMEOUT,
            mode: TargetMode::Any,
            tunnel: None,
            dialer: None,
        }
    }

    async fn check_one(&self, entry: String) -> Result<CheckResult, ProbeError> {
        let started = Instant::now();
        match dial_stream(self.dialer.as_ref(), &entry, self.timeout).await {
            Ok(stream) => {
                // The socket is only probed, never used.
                drop(stream);
                Ok(CheckResult::ok(&entry, started.elapsed(), "connected"))
            }
            Err(e) => Ok(CheckResult::fail(&entry, started.elapsed(), e.to_string())),
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn check(
        &self,
        ctx: &CancellationToken,
        target: &str,
    ) -> Result<CheckResult, ProbeError> {
        if let Some(pending) = tunnel_gate(self.tunnel.as_ref(), target).await {
            return Ok(pending);
        }
        // Each dial carries its own timeout; only cancellation cuts
        // the fan-out short.
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

    fn set_dialer(&mut self, dial: DialFn) {
        self.dialer = Some(dial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = TcpProbe::new();
        let result = probe
            .check(&CancellationToken::new(), &addr.to_string())
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn fails_against_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut probe = TcpProbe::new();
        probe.set_timeout(Duration::from_millis(500));
        let result = probe
            .check(&CancellationToken::new(), &addr.to_string())
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn all_mode_reports_failing_entry() {
        let ok = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ok_addr = ok.local_addr().unwrap().to_string();
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let mut probe = TcpProbe::new();
        probe.set_timeout(Duration::from_millis(500));
        probe.set_target_mode(TargetMode::All);
        let target = format!("{},{}", ok_addr, dead_addr);
        let result = probe
            .check(&CancellationToken::new(), &target)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.target, dead_addr);
    }
}
