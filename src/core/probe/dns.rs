//! DNS probe: issues a lookup against the target name server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::TargetMode;
use crate::core::dial::with_default_port;
use crate::core::error::ProbeError;
use crate::core::result::CheckResult;
use crate::core::tunnel::Tunnel;

use super::{cancellable, fan_out, tunnel_gate, Probe};

const DNS_PORT: u16 = 53;

pub struct DnsProbe {
    domain: String,
    timeout: Duration,
    mode: TargetMode,
    tunnel: Option<Arc<dyn Tunnel>>,
}

impl DnsProbe {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            timeout: crate::config::DEFAULT_TIMEOUT,
            mode: TargetMode::Any,
            tunnel: None,
        }
    }

    async fn check_one(&self, entry: String) -> Result<CheckResult, ProbeError> {
        let started = Instant::now();
        let addr = with_default_port(&entry, DNS_PORT);
        let server: SocketAddr = match tokio::time::timeout(
            self.timeout,
            tokio::net::lookup_host(addr.clone()),
        )
        .await
        {
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(a) => a,
                None => {
                    return Ok(CheckResult::fail(
                        &entry,
                        started.elapsed(),
                        format!("{} resolves to no addresses", addr),
                    ))
                }
            },
            Ok(Err(e)) => {
                return Ok(CheckResult::fail(
                    &entry,
                    started.elapsed(),
                    format!("resolving name server {}: {}", addr, e),
                ))
            }
            Err(_) => {
                return Ok(CheckResult::fail(
                    &entry,
                    started.elapsed(),
                    "name server resolution timed out",
                ))
            }
        };

        // UDP first, TCP as the retry path.
        match self.lookup(server, Protocol::Udp).await {
            Ok(count) => {
                return Ok(CheckResult::ok(
                    &entry,
                    started.elapsed(),
                    format!("{} resolved to {} addresses", self.domain, count),
                ))
            }
            Err(udp_err) => {
                tracing::debug!(server = %server, "udp lookup failed, retrying over tcp: {}", udp_err);
            }
        }
        match self.lookup(server, Protocol::Tcp).await {
            Ok(count) => Ok(CheckResult::ok(
                &entry,
                started.elapsed(),
                format!("{} resolved to {} addresses (tcp)", self.domain, count),
            )),
            Err(e) => Ok(CheckResult::fail(&entry, started.elapsed(), e)),
        }
    }

    async fn lookup(&self, server: SocketAddr, protocol: Protocol) -> Result<usize, String> {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(server, protocol));
        let mut opts = ResolverOpts::default();
        opts.timeout = self.timeout;
        opts.attempts = 1;

        let resolver = TokioAsyncResolver::tokio(config, opts);
        let response = resolver
            .lookup_ip(self.domain.as_str())
            .await
            .map_err(|e| e.to_string())?;
        let count = response.iter().count();
        if count == 0 {
            return Err(format!("{} resolved to no addresses", self.domain));
        }
        Ok(count)
    }
}

#[async_trait]
impl Probe for DnsProbe {
    fn name(&self) -> &'static str {
        "dns"
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
