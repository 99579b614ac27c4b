//! HTTP(S) probe: status acceptance, response expectations, and
//! certificate expiry annotation.
//!
//! Requests are issued over a hyper http1 connection on whatever stream
//! the dialer produced, so the same code path serves direct and
//! tunneled checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::header::HOST;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{HttpOptions, MatchExpectation, TargetMode};
use crate::core::dial::{BoxedStream, DialFn};
use crate::core::error::ProbeError;
use crate::core::result::CheckResult;
use crate::core::tunnel::Tunnel;

use super::tls::{certificate_not_after, judge_expiry, tls_client_config};
use super::{cancellable, dial_stream, fan_out, matchers, tunnel_gate, Probe};

/// Run one http1 request over an already-connected stream.
pub(crate) async fn http1_roundtrip(
    stream: BoxedStream,
    request: Request<Empty<Bytes>>,
) -> Result<(u16, HashMap<String, String>, Bytes), String> {
    let io = TokioIo::new(stream);
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| format!("http handshake: {}", e))?;
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("request failed: {}", e))?;

    let status = response.status().as_u16();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("reading body: {}", e))?
        .to_bytes();
    Ok((status, headers, body))
}

/// Inclusive status ranges parsed from config ("204", "200-299").
#[derive(Debug, Clone, Copy)]
struct StatusRange {
    lo: u16,
    hi: u16,
}

fn parse_status_codes(items: &[String]) -> Result<Vec<StatusRange>, ProbeError> {
    let mut ranges = Vec::with_capacity(items.len());
    for item in items {
        let range = match item.split_once('-') {
            Some((lo, hi)) => {
                let lo = lo.trim().parse().map_err(|_| bad_code(item))?;
                let hi = hi.trim().parse().map_err(|_| bad_code(item))?;
                StatusRange { lo, hi }
            }
            None => {
                let code = item.trim().parse().map_err(|_| bad_code(item))?;
                StatusRange { lo: code, hi: code }
            }
        };
        if range.lo > range.hi {
            return Err(bad_code(item));
        }
        ranges.push(range);
    }
    Ok(ranges)
}

fn bad_code(item: &str) -> ProbeError {
    ProbeError::Misconfigured(format!("invalid accepted status code {:?}", item))
}

pub struct HttpProbe {
    method: String,
    headers: HashMap<String, String>,
    accepted: Vec<StatusRange>,
    expectations: Vec<MatchExpectation>,
    expiry_threshold: Duration,
    insecure_skip_verify: bool,
    timeout: Duration,
    mode: TargetMode,
    tunnel: Option<Arc<dyn Tunnel>>,
    dialer: Option<DialFn>,
}

impl HttpProbe {
    pub fn new(options: &HttpOptions) -> Result<Self, ProbeError> {
        Ok(Self {
            method: options
                .method
                .clone()
                .unwrap_or_else(|| "GET".to_string())
                .to_ascii_uppercase(),
            headers: options.headers.clone(),
            accepted: parse_status_codes(&options.accepted_status_codes)?,
            expectations: options.match_data.clone(),
            expiry_threshold: options.expiry_threshold.unwrap_or(Duration::ZERO),
            insecure_skip_verify: options.insecure_skip_verify,
            timeout: crate::config::DEFAULT_TIMEOUT,
            mode: TargetMode::Any,
            tunnel: None,
            dialer: None,
        })
    }

    fn status_acceptable(&self, status: u16) -> bool {
        if self.accepted.is_empty() {
            return (200..=399).contains(&status);
        }
        self.accepted
            .iter()
            .any(|r| (r.lo..=r.hi).contains(&status))
    }

    async fn check_one(&self, entry: String) -> Result<CheckResult, ProbeError> {
        let started = Instant::now();
        let url = match Url::parse(&entry) {
            Ok(url) => url,
            Err(e) => {
                return Err(ProbeError::InvalidTarget {
                    target: entry,
                    reason: e.to_string(),
                })
            }
        };
        let https = url.scheme() == "https";
        if !https && url.scheme() != "http" {
            return Err(ProbeError::InvalidTarget {
                target: entry,
                reason: format!("unsupported scheme {:?}", url.scheme()),
            });
        }
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let addr = format!("{}:{}", host, port);

        let stream = match dial_stream(self.dialer.as_ref(), &addr, self.timeout).await {
            Ok(s) => s,
            Err(e) => return Ok(CheckResult::fail(&entry, started.elapsed(), e.to_string())),
        };

        // TLS upgrade, keeping the leaf certificate for the expiry check.
        let (stream, not_after): (BoxedStream, Option<DateTime<Utc>>) = if https {
            match self.tls_upgrade(&host, stream).await {
                Ok(pair) => pair,
                Err(message) => {
                    return Ok(CheckResult::fail(&entry, started.elapsed(), message))
                }
            }
        } else {
            (stream, None)
        };

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path = format!("{}?{}", path, query);
        }
        let mut builder = Request::builder().method(self.method.as_str()).uri(path);
        builder = builder.header(HOST, host.as_str());
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::Internal(format!("building request: {}", e)))?;

        let roundtrip = tokio::time::timeout(self.timeout, http1_roundtrip(stream, request));
        let (status, headers, body) = match roundtrip.await {
            Ok(Ok(parts)) => parts,
            Ok(Err(message)) => {
                return Ok(CheckResult::fail(&entry, started.elapsed(), message))
            }
            Err(_) => {
                return Ok(CheckResult::fail(
                    &entry,
                    started.elapsed(),
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        };

        if !self.status_acceptable(status) {
            return Ok(CheckResult::fail(
                &entry,
                started.elapsed(),
                format!("unacceptable status {}", status),
            ));
        }

        let data = matchers::ResponseData {
            body: &body,
            headers: &headers,
        };
        for expectation in &self.expectations {
            if let Err(message) = matchers::evaluate(expectation, &data) {
                return Ok(CheckResult::fail(&entry, started.elapsed(), message));
            }
        }

        let mut message = format!("status {}", status);
        if !self.expiry_threshold.is_zero() {
            if let Some(not_after) = not_after {
                match judge_expiry(not_after, self.expiry_threshold) {
                    Ok(days) => {
                        message = format!("{}; certificate valid for {} days", message, days)
                    }
                    Err(expiry_message) => {
                        return Ok(CheckResult::fail(&entry, started.elapsed(), expiry_message))
                    }
                }
            }
        }

        Ok(CheckResult::ok(&entry, started.elapsed(), message))
    }

    async fn tls_upgrade(
        &self,
        host: &str,
        stream: BoxedStream,
    ) -> Result<(BoxedStream, Option<DateTime<Utc>>), String> {
        let connector = TlsConnector::from(tls_client_config(self.insecure_skip_verify));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| format!("invalid server name {:?}", host))?;
        let tls = tokio::time::timeout(self.timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| "tls handshake timed out".to_string())?
            .map_err(|e| format!("tls handshake: {}", e))?;

        let not_after = {
            let (_, connection) = tls.get_ref();
            connection
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|der| certificate_not_after(der).ok())
        };
        Ok((Box::new(tls), not_after))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn name(&self) -> &'static str {
        "http"
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/", addr)
    }

    fn probe(options: HttpOptions) -> HttpProbe {
        let mut probe = HttpProbe::new(&options).unwrap();
        probe.set_timeout(Duration::from_secs(2));
        probe
    }

    #[tokio::test]
    async fn default_acceptance_is_200_to_399() {
        let url = serve_once("HTTP/1.1 301 Moved Permanently\r\ncontent-length: 0\r\n\r\n").await;
        let result = probe(HttpOptions::default())
            .check(&CancellationToken::new(), &url)
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn server_error_fails() {
        let url = serve_once("HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n").await;
        let result = probe(HttpOptions::default())
            .check(&CancellationToken::new(), &url)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("500"));
    }

    #[tokio::test]
    async fn accepted_codes_override_defaults() {
        let url = serve_once("HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n").await;
        let options = HttpOptions {
            accepted_status_codes: vec!["404".to_string()],
            ..HttpOptions::default()
        };
        let result = probe(options)
            .check(&CancellationToken::new(), &url)
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn status_ranges_parse() {
        let options = HttpOptions {
            accepted_status_codes: vec!["200-204".to_string(), "418".to_string()],
            ..HttpOptions::default()
        };
        let p = HttpProbe::new(&options).unwrap();
        assert!(p.status_acceptable(202));
        assert!(p.status_acceptable(418));
        assert!(!p.status_acceptable(301));

        let bad = HttpOptions {
            accepted_status_codes: vec!["abc".to_string()],
            ..HttpOptions::default()
        };
        assert!(HttpProbe::new(&bad).is_err());
    }

    #[tokio::test]
    async fn body_expectation_fails_the_check() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-length: 9\r\n\r\nunhealthy",
        )
        .await;
        let options = HttpOptions {
            match_data: vec![MatchExpectation {
                source: crate::config::MatchSource::Body,
                selector: None,
                op: crate::config::MatchOp::Eq,
                value: "healthy".to_string(),
            }],
            ..HttpOptions::default()
        };
        let result = probe(options)
            .check(&CancellationToken::new(), &url)
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn connection_refused_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = probe(HttpOptions::default())
            .check(&CancellationToken::new(), &format!("http://{}/", addr))
            .await
            .unwrap();
        assert!(!result.success);
    }
}
