//! Userspace WireGuard tunnel.
//!
//! Lifecycle: initialize builds the boringtun device, the virtual
//! stack, and the UDP pump; probes dial virtual TCP connections through
//! it. Failure reports are suppressed while the tunnel demonstrably
//! works (recent handshake or recent probe success) so one flapping
//! upstream cannot trigger a restart storm.

pub mod device;
pub mod event_loop;
pub mod stack;
pub mod stream;

use std::any::Any;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::{TunnelKind, WireguardConfig};
use crate::core::dial::{split_host_port, BoxedStream, NET_TCP};
use crate::core::error::TunnelError;

use super::{Tunnel, STABILIZATION_WINDOW};
use event_loop::WgEventLoop;

/// Handshakes younger than this always suppress a failure report.
const HANDSHAKE_GRACE: Duration = Duration::from_secs(5 * 60);

/// Success window applied until the watchdog computes the real one.
const DEFAULT_SUCCESS_WINDOW: Duration = Duration::from_secs(60);

const DEFAULT_WG_PORT: u16 = 51820;

pub struct WireguardTunnel {
    name: String,
    config: WireguardConfig,
    state: Mutex<Option<Arc<WgEventLoop>>>,
    /// Mirrors `state.is_some()` for lock-free stabilization checks.
    live: AtomicBool,
    init_time: StdMutex<Option<Instant>>,
    last_success: StdMutex<Option<Instant>>,
    success_window: StdMutex<Duration>,
    /// Unix seconds of the most recent handshake; 0 while none.
    handshake_clock: Arc<AtomicU64>,
}

/// "a.b.c.d/len" or a bare IPv4 address (treated as /32).
fn parse_address(addr: &str) -> Result<(Ipv4Addr, u8), TunnelError> {
    let (ip, prefix) = match addr.split_once('/') {
        Some((ip, len)) => {
            let prefix: u8 = len
                .parse()
                .map_err(|_| TunnelError::Init(format!("invalid address prefix in {:?}", addr)))?;
            (ip, prefix)
        }
        None => (addr, 32),
    };
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| TunnelError::Init(format!("invalid tunnel address {:?}", addr)))?;
    if prefix > 32 {
        return Err(TunnelError::Init(format!("invalid address prefix in {:?}", addr)));
    }
    Ok((ip, prefix))
}

impl WireguardTunnel {
    pub fn new(name: String, config: WireguardConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(None),
            live: AtomicBool::new(false),
            init_time: StdMutex::new(None),
            last_success: StdMutex::new(None),
            success_window: StdMutex::new(DEFAULT_SUCCESS_WINDOW),
            handshake_clock: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn success_window(&self) -> Duration {
        *self.success_window.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_init_time(&self, value: Option<Instant>) {
        *self.init_time.lock().unwrap_or_else(|p| p.into_inner()) = value;
    }

    /// One-shot UDP datagram through the tunnel, used by the udp probe.
    pub async fn send_udp_datagram(&self, addr: &str, payload: &[u8]) -> Result<(), TunnelError> {
        self.initialize().await?;
        let pump = self
            .state
            .lock()
            .await
            .clone()
            .ok_or(TunnelError::NotConnected)?;
        let (host, port) = split_host_port(addr, 0);
        let remote: Ipv4Addr = host.parse().map_err(|_| TunnelError::Dial {
            addr: addr.to_string(),
            reason: "tunnel targets must be IPv4 addresses".to_string(),
        })?;
        pump.send_udp(remote, port, payload.to_vec()).await
    }

    async fn teardown(&self) {
        let mut state = self.state.lock().await;
        if let Some(pump) = state.take() {
            pump.shutdown();
        }
        self.live.store(false, Ordering::Release);
        self.set_init_time(None);
        self.handshake_clock.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl Tunnel for WireguardTunnel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TunnelKind {
        TunnelKind::Wireguard
    }

    /// Idempotent: a live device is kept as-is.
    async fn initialize(&self) -> Result<(), TunnelError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let first_addr = self
            .config
            .addresses
            .first()
            .ok_or_else(|| TunnelError::Init("no addresses configured".into()))?;
        let (local_ip, prefix_len) = parse_address(first_addr)?;

        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| TunnelError::Init("no endpoint configured".into()))?;
        let endpoint = crate::core::dial::with_default_port(endpoint, DEFAULT_WG_PORT);
        let peer = tokio::net::lookup_host(&endpoint)
            .await
            .map_err(|e| TunnelError::Init(format!("resolve {}: {}", endpoint, e)))?
            .next()
            .ok_or_else(|| TunnelError::Init(format!("{} resolves to no addresses", endpoint)))?;

        let pump = WgEventLoop::start(
            &self.config,
            local_ip,
            prefix_len,
            peer,
            self.handshake_clock.clone(),
        )
        .await?;

        *state = Some(Arc::new(pump));
        self.live.store(true, Ordering::Release);
        self.set_init_time(Some(Instant::now()));
        tracing::info!(tunnel = %self.name, peer = %peer, "wireguard tunnel initialized");
        Ok(())
    }

    async fn stop(&self) {
        self.teardown().await;
    }

    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedStream, TunnelError> {
        if network != NET_TCP {
            return Err(TunnelError::UnsupportedNetwork {
                tunnel: self.name.clone(),
                network: network.to_string(),
            });
        }
        // A torn-down tunnel re-initializes on next use.
        self.initialize().await?;
        let pump = self
            .state
            .lock()
            .await
            .clone()
            .ok_or(TunnelError::NotConnected)?;

        let (host, port) = split_host_port(addr, 0);
        if port == 0 {
            return Err(TunnelError::Dial {
                addr: addr.to_string(),
                reason: "address has no port".to_string(),
            });
        }
        let remote: Ipv4Addr = host.parse().map_err(|_| TunnelError::Dial {
            addr: addr.to_string(),
            reason: "tunnel targets must be IPv4 addresses".to_string(),
        })?;
        let stream = pump
            .connect(remote, port, Duration::from_secs(10))
            .await?;
        Ok(Box::new(stream))
    }

    fn last_init_time(&self) -> Option<Instant> {
        *self.init_time.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_stabilized(&self) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        self.last_init_time()
            .map_or(false, |t| t.elapsed() >= STABILIZATION_WINDOW)
    }

    fn report_success(&self) {
        *self.last_success.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
    }

    /// Tear down only when the tunnel shows no recent sign of life;
    /// otherwise the report is dropped.
    async fn report_failure(&self) {
        let handshake_recent = self.last_handshake().map_or(false, |at| {
            SystemTime::now()
                .duration_since(at)
                .map_or(false, |age| age < HANDSHAKE_GRACE)
        });

        let last_success = {
            let success = *self.last_success.lock().unwrap_or_else(|p| p.into_inner());
            match (success, self.last_init_time()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            }
        };
        let success_recent =
            last_success.map_or(false, |at| at.elapsed() < self.success_window());

        if handshake_recent || success_recent {
            tracing::info!(
                tunnel = %self.name,
                handshake_recent,
                success_recent,
                "wireguard restart suppressed"
            );
            return;
        }

        tracing::warn!(tunnel = %self.name, "wireguard tunnel unhealthy, tearing down");
        self.teardown().await;
    }

    fn set_success_window(&self, window: Duration) {
        *self.success_window.lock().unwrap_or_else(|p| p.into_inner()) = window;
    }

    fn last_handshake(&self) -> Option<SystemTime> {
        match self.handshake_clock.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(UNIX_EPOCH + Duration::from_secs(secs)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
