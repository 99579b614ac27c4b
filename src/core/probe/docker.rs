//! Docker probe: container state over the Engine API.
//!
//! The referenced docker socket is either a unix domain socket or a
//! host:port endpoint; TCP endpoints may be reached through a tunnel.

#[cfg(test)]
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::HOST;
use hyper::Request;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::{DockerSocketSpec, TargetMode};
use crate::core::dial::{BoxedStream, DialFn};
use crate::core::error::ProbeError;
use crate::core::result::CheckResult;
use crate::core::tunnel::Tunnel;

use super::http::http1_roundtrip;
use super::{cancellable, dial_stream, fan_out, tunnel_gate, Probe};

/// Subset of the `GET /containers/<name>/json` response.
#[derive(Debug, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "State")]
    state: ContainerState,
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Health")]
    health: Option<ContainerHealth>,
}

#[derive(Debug, Deserialize)]
struct ContainerHealth {
    #[serde(rename = "Status")]
    status: String,
}

pub struct DockerProbe {
    socket: DockerSocketSpec,
    require_healthy: bool,
    timeout: Duration,
    mode: TargetMode,
    tunnel: Option<Arc<dyn Tunnel>>,
    dialer: Option<DialFn>,
}

impl DockerProbe {
    pub fn new(socket: DockerSocketSpec, require_healthy: bool) -> Self {
        Self {
            socket,
            require_healthy,
            timeout: crate::config::DEFAULT_TIMEOUT,
            mode: TargetMode::Any,
            tunnel: None,
            dialer: None,
        }
    }

    async fn open_socket(&self) -> Result<BoxedStream, String> {
        if let Some(path) = self.socket.socket.as_deref() {
            let stream =
                tokio::time::timeout(self.timeout, tokio::net::UnixStream::connect(path))
                    .await
                    .map_err(|_| format!("connecting {} timed out", path))?
                    .map_err(|e| format!("connecting {}: {}", path, e))?;
            return Ok(Box::new(stream));
        }
        let addr = self
            .socket
            .tcp_addr()
            .ok_or_else(|| "docker socket has neither path nor host".to_string())?;
        let stream = dial_stream(self.dialer.as_ref(), &addr, self.timeout)
            .await
            .map_err(|e| e.to_string())?;

        if self.socket.protocol.as_deref() != Some("https") {
            return Ok(stream);
        }
        let host = self
            .socket
            .host
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        let connector =
            tokio_rustls::TlsConnector::from(super::tls::tls_client_config(false));
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| format!("invalid server name {:?}", host))?;
        let tls = tokio::time::timeout(self.timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| "tls handshake timed out".to_string())?
            .map_err(|e| format!("tls handshake: {}", e))?;
        Ok(Box::new(tls))
    }

    async fn inspect(&self, container: &str) -> Result<ContainerInspect, String> {
        let stream = self.open_socket().await?;

        let host_header = self
            .socket
            .host
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        let mut builder = Request::builder()
            .method("GET")
            .uri(format!("/containers/{}/json", container))
            .header(HOST, host_header);
        for (name, value) in &self.socket.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| format!("building request: {}", e))?;

        let (status, _headers, body) =
            tokio::time::timeout(self.timeout, http1_roundtrip(stream, request))
                .await
                .map_err(|_| format!("inspect timed out after {:?}", self.timeout))??;

        match status {
            200 => serde_json::from_slice(&body)
                .map_err(|e| format!("parsing inspect response: {}", e)),
            404 => Err(format!("no such container {:?}", container)),
            other => Err(format!("docker daemon answered {}", other)),
        }
    }

    async fn check_one(&self, container: String) -> Result<CheckResult, ProbeError> {
        let started = Instant::now();
        let inspect = match self.inspect(&container).await {
            Ok(i) => i,
            Err(message) => {
                return Ok(CheckResult::fail(&container, started.elapsed(), message))
            }
        };

        if inspect.state.status != "running" {
            return Ok(CheckResult::fail(
                &container,
                started.elapsed(),
                format!("container is {}", inspect.state.status),
            ));
        }
        if self.require_healthy {
            if let Some(health) = inspect.state.health.as_ref() {
                if health.status != "healthy" {
                    return Ok(CheckResult::fail(
                        &container,
                        started.elapsed(),
                        format!("container health is {}", health.status),
                    ));
                }
            }
        }
        Ok(CheckResult::ok(&container, started.elapsed(), "running"))
    }
}

#[async_trait]
impl Probe for DockerProbe {
    fn name(&self) -> &'static str {
        "docker"
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
