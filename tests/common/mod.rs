//! Shared fixtures for the integration tests.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal HTTP server capturing the request line of every request.
///
/// Each connection is answered with the configured status code and an
/// empty body; the method and request target are recorded for
/// assertions.
pub struct CaptureServer {
    addr: std::net::SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CaptureServer {
    pub async fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let log = log.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let Ok(n) = socket.read(&mut buf).await else {
                        return;
                    };
                    let head = String::from_utf8_lossy(&buf[..n]);
                    if let Some(line) = head.lines().next() {
                        log.lock().unwrap().push(line.to_string());
                    }
                    let response = format!(
                        "HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Recorded request lines ("GET /x?y=1 HTTP/1.1").
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Request targets ("/x?y=1") of every recorded request.
    pub fn request_targets(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|line| line.split_whitespace().nth(1).map(String::from))
            .collect()
    }

    /// Poll until at least `count` requests arrived or the deadline
    /// passes.
    pub async fn wait_for_hits(&self, count: usize, deadline: std::time::Duration) -> bool {
        let until = tokio::time::Instant::now() + deadline;
        while tokio::time::Instant::now() < until {
            if self.hits() >= count {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.hits() >= count
    }
}

/// A WireGuard keypair in the base64 wire format.
pub fn wireguard_keypair() -> (String, String) {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    let secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    (
        BASE64.encode(secret.to_bytes()),
        BASE64.encode(public.to_bytes()),
    )
}
