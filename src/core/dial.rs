//! Stream dialing shared by probes and tunnels.
//!
//! A probe either dials directly over the host network or through a
//! tunnel. Both paths produce a [`BoxedStream`]; the probe code never
//! knows which one it got.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::error::TunnelError;

/// Network tags understood by dialers.
pub const NET_TCP: &str = "tcp";
pub const NET_UDP: &str = "udp";
pub const NET_PING4: &str = "ping4";

pub trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncConn for T {}

/// A connected byte stream of unknown provenance.
pub type BoxedStream = Box<dyn AsyncConn>;

pub type DialFuture = Pin<Box<dyn Future<Output = Result<BoxedStream, TunnelError>> + Send>>;

/// Dialer closure installed on probes by the factory. Arguments are the
/// network tag and a "host:port" address.
pub type DialFn = Arc<dyn Fn(&str, &str) -> DialFuture + Send + Sync>;

/// Direct TCP dial bounded by `timeout`, used when no tunnel is attached.
pub async fn dial_tcp_direct(addr: &str, timeout: Duration) -> Result<BoxedStream, TunnelError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::Dial {
            addr: addr.to_string(),
            reason: "connect timed out".to_string(),
        })?
        .map_err(|e| TunnelError::Dial {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    Ok(Box::new(stream))
}

/// Split "host:port" into host and port, applying a default port when
/// the address has none. Handles bracketed IPv6 literals.
pub fn split_host_port(addr: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (addr.to_string(), default_port),
        },
        _ => (addr.to_string(), default_port),
    }
}

/// Ensure an address carries a port.
pub fn with_default_port(addr: &str, default_port: u16) -> String {
    let (host, port) = split_host_port(addr, default_port);
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("example.com:8080", 22), ("example.com".into(), 8080));
        assert_eq!(split_host_port("example.com", 22), ("example.com".into(), 22));
        assert_eq!(split_host_port("[::1]:443", 22), ("::1".into(), 443));
        assert_eq!(split_host_port("[::1]", 22), ("::1".into(), 22));
    }

    #[test]
    fn appends_default_port() {
        assert_eq!(with_default_port("db", 5432), "db:5432");
        assert_eq!(with_default_port("db:6000", 5432), "db:6000");
        assert_eq!(with_default_port("[::1]", 53), "[::1]:53");
    }
}
