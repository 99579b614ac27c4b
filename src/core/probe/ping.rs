//! ICMP echo probe.
//!
//! Preference order: an echo socket from the dialer, then a userspace
//! echo via raw/datagram ICMP. When neither is available the probe
//! falls back to `ping`: run on the tunnel host for SSH tunnels, the
//! local binary otherwise.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::random;
use regex::Regex;
use surge_ping::{Client, Config, PingIdentifier, PingSequence};
use tokio_util::sync::CancellationToken;

use crate::config::{TargetMode, TunnelKind};
use crate::core::dial::{DialFn, NET_PING4};
use crate::core::error::ProbeError;
use crate::core::result::CheckResult;
use crate::core::tunnel::{SshTunnel, Tunnel};

use super::{cancellable, fan_out, tunnel_gate, Probe};

/// Reported duration when the ping exits cleanly but no RTT could be
/// parsed from its output.
const FALLBACK_RTT: Duration = Duration::from_millis(1);

pub struct PingProbe {
    timeout: Duration,
    mode: TargetMode,
    tunnel: Option<Arc<dyn Tunnel>>,
    dialer: Option<DialFn>,
}

impl PingProbe {
    pub fn new() -> Self {
        Self {
            timeout: crate::config::DEFAULT_TIMEOUT,
            mode: TargetMode::Any,
            tunnel: None,
            dialer: None,
        }
    }

    fn wait_seconds(&self) -> u64 {
        self.timeout.as_secs().max(1)
    }

    async fn check_one(&self, entry: String) -> Result<CheckResult, ProbeError> {
        let started = Instant::now();

        if let Some(dial) = self.dialer.as_ref() {
            // Preferred path: an echo socket from the dialer.
            match dial(NET_PING4, &entry).await {
                Ok(stream) => return Ok(self.echo_over_stream(stream, &entry, started).await),
                Err(e) if e.is_unsupported_network() => {
                    // Fall back to running ping on the tunnel host
                    // (ssh) or the local ping binary.
                }
                Err(e) => return Ok(CheckResult::fail(&entry, started.elapsed(), e.to_string())),
            }
        }

        if let Some(tunnel) = self.tunnel.as_ref() {
            if tunnel.kind() == TunnelKind::Ssh {
                if let Some(ssh) = tunnel.as_any().downcast_ref::<SshTunnel>() {
                    return Ok(self.remote_ping(ssh, &entry, started).await);
                }
            }
            return Ok(self.os_ping(&entry, started).await);
        }

        match self.icmp_echo(&entry).await {
            Ok(rtt) => Ok(CheckResult::ok(
                &entry,
                rtt,
                format!("reply in {:.1}ms", rtt.as_secs_f64() * 1000.0),
            )),
            Err(EchoError::Unsupported(reason)) => {
                tracing::debug!(target = %entry, "icmp socket unavailable ({}), using os ping", reason);
                Ok(self.os_ping(&entry, started).await)
            }
            Err(EchoError::Failed(message)) => {
                Ok(CheckResult::fail(&entry, started.elapsed(), message))
            }
        }
    }

    /// Hand-rolled echo over a dialer-provided packet stream: write one
    /// request, read one reply, accept only echo replies.
    async fn echo_over_stream(
        &self,
        mut stream: crate::core::dial::BoxedStream,
        entry: &str,
        started: Instant,
    ) -> CheckResult {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let request = icmp_echo_request(random(), 1);
        let exchange = async {
            stream.write_all(&request).await?;
            let mut reply = [0u8; 256];
            let n = stream.read(&mut reply).await?;
            Ok::<_, std::io::Error>(reply[..n].to_vec())
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(reply)) => match parse_icmp_reply(&reply) {
                Ok(()) => {
                    let rtt = started.elapsed();
                    CheckResult::ok(
                        entry,
                        rtt,
                        format!("reply in {:.1}ms", rtt.as_secs_f64() * 1000.0),
                    )
                }
                Err(message) => CheckResult::fail(entry, started.elapsed(), message),
            },
            Ok(Err(e)) => CheckResult::fail(entry, started.elapsed(), e.to_string()),
            Err(_) => CheckResult::fail(
                entry,
                started.elapsed(),
                format!("no echo reply within {:?}", self.timeout),
            ),
        }
    }

    async fn icmp_echo(&self, entry: &str) -> Result<Duration, EchoError> {
        let ip = resolve_ip(entry)
            .await
            .map_err(EchoError::Failed)?;
        let client = Client::new(&Config::default())
            .map_err(|e| EchoError::Unsupported(e.to_string()))?;
        let mut pinger = client.pinger(ip, PingIdentifier(random())).await;
        pinger.timeout(self.timeout);
        match pinger.ping(PingSequence(0), &[0u8; 8]).await {
            Ok((_reply, rtt)) => Ok(rtt),
            Err(e) => Err(EchoError::Failed(e.to_string())),
        }
    }

    async fn remote_ping(&self, ssh: &SshTunnel, entry: &str, started: Instant) -> CheckResult {
        let command = format!("ping -c 1 -W {} {}", self.wait_seconds(), entry);
        match ssh.exec(&command).await {
            Ok((0, output)) => {
                let output = String::from_utf8_lossy(&output);
                finish_ping(entry, started, &output)
            }
            Ok((status, _)) => CheckResult::fail(
                entry,
                started.elapsed(),
                format!("remote ping exited with status {}", status),
            ),
            Err(e) => CheckResult::fail(entry, started.elapsed(), e.to_string()),
        }
    }

    async fn os_ping(&self, entry: &str, started: Instant) -> CheckResult {
        let mut command = tokio::process::Command::new("ping");
        if cfg!(windows) {
            command.args([
                "-n",
                "1",
                "-w",
                &self.timeout.as_millis().to_string(),
                entry,
            ]);
        } else {
            command.args(["-c", "1", "-W", &self.wait_seconds().to_string(), entry]);
        }
        command.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout + Duration::from_secs(1), command.output());
        match output.await {
            Ok(Ok(out)) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                finish_ping(entry, started, &stdout)
            }
            Ok(Ok(out)) => CheckResult::fail(
                entry,
                started.elapsed(),
                format!("ping exited with {}", out.status),
            ),
            Ok(Err(e)) => {
                CheckResult::fail(entry, started.elapsed(), format!("spawning ping: {}", e))
            }
            Err(_) => CheckResult::fail(entry, started.elapsed(), "ping timed out"),
        }
    }
}

enum EchoError {
    /// Raw/datagram ICMP socket could not be created.
    Unsupported(String),
    Failed(String),
}

async fn resolve_ip(entry: &str) -> Result<IpAddr, String> {
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((entry, 0u16))
        .await
        .map_err(|e| format!("resolving {}: {}", entry, e))?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| format!("{} resolves to no addresses", entry))
}

/// ICMPv4 echo request: type 8, code 0, checksum, identifier,
/// sequence, 8 bytes of payload.
fn icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![8, 0, 0, 0, 0, 0, 0, 0];
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(b"probixel");
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for pair in data.chunks(2) {
        let word = if pair.len() == 2 {
            u16::from_be_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], 0])
        };
        sum = sum.wrapping_add(u32::from(word));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Accept echo replies (type 0); any other ICMP type fails the check.
fn parse_icmp_reply(packet: &[u8]) -> Result<(), String> {
    if packet.len() < 8 {
        return Err("short icmp reply".to_string());
    }
    match packet[0] {
        0 => Ok(()),
        3 => Err("destination unreachable".to_string()),
        11 => Err("time exceeded".to_string()),
        other => Err(format!("unexpected icmp type {}", other)),
    }
}

/// Extract "time=<float> ms" from ping output.
fn parse_rtt(output: &str) -> Option<Duration> {
    let re = Regex::new(r"time[=<]([0-9.]+) ?ms").ok()?;
    let captures = re.captures(output)?;
    let ms: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(Duration::from_secs_f64(ms / 1000.0))
}

fn finish_ping(entry: &str, _started: Instant, output: &str) -> CheckResult {
    match parse_rtt(output) {
        Some(rtt) => CheckResult::ok(
            entry,
            rtt,
            format!("reply in {:.1}ms", rtt.as_secs_f64() * 1000.0),
        ),
        None => CheckResult::ok(entry, FALLBACK_RTT, "OK (time parse fail)"),
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for PingProbe {
    fn name(&self) -> &'static str {
        "ping"
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

    fn set_dialer(&mut self, dial: DialFn) {
        self.dialer = Some(dial);
    }
}
