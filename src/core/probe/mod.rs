//! Probe implementations.
//!
//! A probe performs one measurement against a target and returns a
//! [`CheckResult`]. Expected failures are failed results; `Err` is
//! reserved for misconfiguration and bugs.

pub mod docker;
pub mod dns;
pub mod host;
pub mod http;
pub mod matchers;
pub mod ping;
pub mod ssh;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod wireguard;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::TargetMode;

use super::dial::{dial_tcp_direct, BoxedStream, DialFn, NET_TCP};
use super::error::{ProbeError, TunnelError};
use super::result::CheckResult;
use super::tunnel::Tunnel;

pub use docker::DockerProbe;
pub use dns::DnsProbe;
pub use host::HostProbe;
pub use http::HttpProbe;
pub use ping::PingProbe;
pub use ssh::SshProbe;
pub use tcp::TcpProbe;
pub use tls::TlsProbe;
pub use udp::UdpProbe;
pub use wireguard::WireguardProbe;

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one check. `target` is the service's resolved target string
    /// (possibly comma-separated).
    async fn check(
        &self,
        ctx: &CancellationToken,
        target: &str,
    ) -> Result<CheckResult, ProbeError>;

    fn set_timeout(&mut self, timeout: Duration);

    fn set_target_mode(&mut self, _mode: TargetMode) {}

    /// Probes that look at tunnel state directly (wireguard heartbeat,
    /// remote ping) receive the tunnel here.
    fn set_tunnel(&mut self, _tunnel: Arc<dyn Tunnel>) {}

    /// Installed by the factory for services that dial through a tunnel.
    fn set_dialer(&mut self, _dial: DialFn) {}

    /// One-shot expensive setup; default is none.
    async fn initialize(&mut self) -> Result<(), ProbeError> {
        Ok(())
    }
}

/// Pending gate shared by all dial-based probes: while the attached
/// tunnel is not stabilized, no I/O happens and the result is pending.
/// Nudges a torn-down tunnel back into initialization so it can
/// eventually stabilize again.
pub(crate) async fn tunnel_gate(
    tunnel: Option<&Arc<dyn Tunnel>>,
    target: &str,
) -> Option<CheckResult> {
    let tunnel = tunnel?;
    if tunnel.is_stabilized() {
        return None;
    }
    if let Err(e) = tunnel.initialize().await {
        tracing::warn!(tunnel = tunnel.name(), "tunnel initialization failed: {}", e);
    }
    Some(CheckResult::pending(
        target,
        format!("tunnel {} is not stabilized yet", tunnel.name()),
    ))
}

/// Dial a TCP stream through the installed dialer, or directly when
/// the probe has none.
pub(crate) async fn dial_stream(
    dialer: Option<&DialFn>,
    addr: &str,
    timeout: Duration,
) -> Result<BoxedStream, TunnelError> {
    match dialer {
        Some(dial) => tokio::time::timeout(timeout, dial(NET_TCP, addr))
            .await
            .map_err(|_| TunnelError::Dial {
                addr: addr.to_string(),
                reason: "dial timed out".to_string(),
            })?,
        None => dial_tcp_direct(addr, timeout).await,
    }
}

/// Split a comma-separated target list, run `check_one` per entry, and
/// combine per the target mode.
pub(crate) async fn fan_out<F, Fut>(
    target: &str,
    mode: TargetMode,
    check_one: F,
) -> Result<CheckResult, ProbeError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<CheckResult, ProbeError>>,
{
    let entries: Vec<&str> = target
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    if entries.is_empty() {
        return Ok(CheckResult::fail(target, Duration::ZERO, "no targets"));
    }
    if entries.len() == 1 {
        return check_one(entries[0].to_string()).await;
    }

    match mode {
        TargetMode::Any => {
            let mut last = CheckResult::fail(target, Duration::ZERO, "no targets");
            for entry in &entries {
                let result = check_one(entry.to_string()).await?;
                if result.pending || result.success {
                    return Ok(result);
                }
                last = result;
            }
            Ok(CheckResult::fail(
                target,
                last.duration,
                format!(
                    "all {} targets failed; last error: {}",
                    entries.len(),
                    last.message
                ),
            ))
        }
        TargetMode::All => {
            let mut total = Duration::ZERO;
            for entry in &entries {
                let result = check_one(entry.to_string()).await?;
                if result.pending || !result.success {
                    // Short-circuit, naming the entry that decided it.
                    return Ok(result);
                }
                total += result.duration;
            }
            let mean = total / entries.len() as u32;
            Ok(CheckResult::ok(
                target,
                mean,
                format!("all {} targets OK", entries.len()),
            ))
        }
    }
}

/// Bound `work` by the caller's cancellation only; used when the work
/// already applies its own per-operation timeouts.
pub(crate) async fn cancellable<T>(
    ctx: &CancellationToken,
    target: &str,
    work: impl Future<Output = T>,
) -> Result<T, CheckResult> {
    let started = std::time::Instant::now();
    tokio::select! {
        _ = ctx.cancelled() => Err(CheckResult::fail(target, started.elapsed(), "check cancelled")),
        outcome = work => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn any_mode_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result = fan_out("bad:80, good:80, unused:80", TargetMode::Any, |entry| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if entry.starts_with("good") {
                    Ok(CheckResult::ok(&entry, Duration::from_millis(5), "connected"))
                } else {
                    Ok(CheckResult::fail(&entry, Duration::from_millis(5), "refused"))
                }
            }
        })
        .await
        .unwrap();
        assert!(result.success);
        assert_eq!(result.target, "good:80");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn any_mode_reports_count_and_last_error() {
        let result = fan_out("a:1,b:2", TargetMode::Any, |entry| async move {
            Ok(CheckResult::fail(&entry, Duration::ZERO, format!("{} down", entry)))
        })
        .await
        .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("all 2 targets failed"));
        assert!(result.message.contains("b:2 down"));
    }

    #[tokio::test]
    async fn all_mode_short_circuits_on_failure() {
        let calls = AtomicUsize::new(0);
        let result = fan_out("ok:80,fail:80,never:80", TargetMode::All, |entry| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if entry.starts_with("fail") {
                    Ok(CheckResult::fail(&entry, Duration::from_millis(1), "refused"))
                } else {
                    Ok(CheckResult::ok(&entry, Duration::from_millis(1), "connected"))
                }
            }
        })
        .await
        .unwrap();
        assert!(!result.success);
        assert_eq!(result.target, "fail:80");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn all_mode_averages_durations() {
        let result = fan_out("a:1,b:2", TargetMode::All, |entry| async move {
            let ms = if entry.starts_with('a') { 10 } else { 30 };
            Ok(CheckResult::ok(&entry, Duration::from_millis(ms), "connected"))
        })
        .await
        .unwrap();
        assert!(result.success);
        assert_eq!(result.duration, Duration::from_millis(20));
        assert_eq!(result.message, "all 2 targets OK");
    }

    #[tokio::test]
    async fn empty_entries_are_skipped() {
        let calls = AtomicUsize::new(0);
        let result = fan_out(" ,a:1,, ", TargetMode::All, |entry| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(CheckResult::ok(&entry, Duration::ZERO, "connected")) }
        })
        .await
        .unwrap();
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellable_observes_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let outcome = cancellable(&ctx, "t", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        assert!(outcome.unwrap_err().message.contains("cancelled"));
    }
}
