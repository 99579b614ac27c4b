//! SSH probe: reachability or a full authenticated handshake.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client;
use tokio_util::sync::CancellationToken;

use crate::config::SshAuthConfig;
use crate::core::dial::{with_default_port, BoxedStream, DialFn};
use crate::core::error::{ProbeError, TunnelError};
use crate::core::result::CheckResult;
use crate::core::tunnel::ssh::{authenticate, AcceptingHandler};
use crate::core::tunnel::{SshTunnel, Tunnel};

use super::{cancellable, dial_stream, tunnel_gate, Probe};

const SSH_PORT: u16 = 22;

pub struct SshProbe {
    auth: SshAuthConfig,
    timeout: Duration,
    tunnel: Option<Arc<dyn Tunnel>>,
    dialer: Option<DialFn>,
}

impl SshProbe {
    pub fn new(auth: SshAuthConfig) -> Self {
        Self {
            auth,
            timeout: crate::config::DEFAULT_TIMEOUT,
            tunnel: None,
            dialer: None,
        }
    }

    async fn check_target(&self, target: &str) -> CheckResult {
        let started = Instant::now();
        let addr = with_default_port(target, SSH_PORT);

        let stream = match dial_stream(self.dialer.as_ref(), &addr, self.timeout).await {
            Ok(s) => s,
            Err(e) => return CheckResult::fail(target, started.elapsed(), e.to_string()),
        };

        if !self.auth.auth_required() {
            // A completed TCP connect is all that was asked for.
            drop(stream);
            return CheckResult::ok(target, started.elapsed(), "port open");
        }

        match tokio::time::timeout(self.timeout, self.handshake(stream)).await {
            Ok(Ok(())) => CheckResult::ok(target, started.elapsed(), "authenticated"),
            Ok(Err(e)) => CheckResult::fail(target, started.elapsed(), e.to_string()),
            Err(_) => CheckResult::fail(
                target,
                started.elapsed(),
                format!("handshake timed out after {:?}", self.timeout),
            ),
        }
    }

    async fn handshake(&self, stream: BoxedStream) -> Result<(), TunnelError> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, stream, AcceptingHandler).await?;
        authenticate(&mut handle, &self.auth).await?;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        Ok(())
    }

    /// With only a tunnel configured, the check is the tunnel's own
    /// authenticated client.
    async fn check_tunnel(&self, tunnel: &Arc<dyn Tunnel>) -> CheckResult {
        let started = Instant::now();
        let name = tunnel.name().to_string();
        let Some(ssh) = tunnel.as_any().downcast_ref::<SshTunnel>() else {
            return CheckResult::fail(&name, started.elapsed(), "tunnel is not ssh");
        };
        match tokio::time::timeout(self.timeout, ssh.get_client()).await {
            Ok(Ok(_)) => CheckResult::ok(&name, started.elapsed(), "authenticated"),
            Ok(Err(e)) => CheckResult::fail(&name, started.elapsed(), e.to_string()),
            Err(_) => CheckResult::fail(
                &name,
                started.elapsed(),
                format!("handshake timed out after {:?}", self.timeout),
            ),
        }
    }
}

#[async_trait]
impl Probe for SshProbe {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn check(
        &self,
        ctx: &CancellationToken,
        target: &str,
    ) -> Result<CheckResult, ProbeError> {
        if let Some(pending) = tunnel_gate(self.tunnel.as_ref(), target).await {
            return Ok(pending);
        }
        let work = async {
            if target.trim().is_empty() {
                match self.tunnel.as_ref() {
                    Some(tunnel) => self.check_tunnel(tunnel).await,
                    None => CheckResult::fail(target, Duration::ZERO, "no target configured"),
                }
            } else {
                self.check_target(target.trim()).await
            }
        };
        match cancellable(ctx, target, work).await {
            Ok(result) => Ok(result),
            Err(interrupted) => Ok(interrupted),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
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
    async fn bare_connect_when_auth_not_required() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let auth = SshAuthConfig {
            auth_required: Some(false),
            ..SshAuthConfig::default()
        };
        let probe = SshProbe::new(auth);
        let result = probe
            .check(&CancellationToken::new(), &addr.to_string())
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn handshake_against_non_ssh_server_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Not an SSH server: accept and close.
            let _ = listener.accept().await;
        });

        let auth = SshAuthConfig {
            user: Some("probe".to_string()),
            password: Some("secret".to_string()),
            ..SshAuthConfig::default()
        };
        let mut probe = SshProbe::new(auth);
        probe.set_timeout(Duration::from_millis(500));
        let result = probe
            .check(&CancellationToken::new(), &addr.to_string())
            .await
            .unwrap();
        assert!(!result.success);
    }
}
