//! Agent-managed network tunnels.
//!
//! A tunnel is a named, long-lived network path (SSH jump host or
//! userspace WireGuard) that probes dial through. Tunnels outlive
//! individual checks but not a supervision epoch: the watchdog rebuilds
//! the registry on every reload.

pub mod ssh;
pub mod wireguard;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;

use super::dial::BoxedStream;
use super::error::TunnelError;
use crate::config::TunnelKind;

pub use ssh::SshTunnel;
pub use wireguard::WireguardTunnel;

/// Duration after (re)initialization during which dial-based probes
/// report pending instead of failing.
pub const STABILIZATION_WINDOW: Duration = Duration::from_secs(20);

#[async_trait]
pub trait Tunnel: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> TunnelKind;

    /// Bring the tunnel up. Idempotent: a tunnel that is already live
    /// returns without rebuilding.
    async fn initialize(&self) -> Result<(), TunnelError>;

    /// Tear down live resources. The tunnel may be initialized again.
    async fn stop(&self);

    /// Open a connection through the tunnel. `network` is one of the
    /// [`crate::core::dial`] tags.
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedStream, TunnelError>;

    /// Instant of the most recent successful initialize, if any.
    fn last_init_time(&self) -> Option<Instant>;

    /// Whether probes may judge results obtained through this tunnel.
    fn is_stabilized(&self) -> bool;

    /// A probe using this tunnel succeeded; feeds the health model.
    fn report_success(&self);

    /// A probe using this tunnel failed. The tunnel decides whether to
    /// tear itself down or suppress the report.
    async fn report_failure(&self);

    /// Applied by the watchdog after construction; only meaningful for
    /// tunnels with a restart-suppression window.
    fn set_success_window(&self, _window: Duration) {}

    /// Wall-clock time of the most recent WireGuard handshake, if this
    /// tunnel has that notion.
    fn last_handshake(&self) -> Option<SystemTime> {
        None
    }

    /// Downcasting hook for probes that need type-specific capabilities
    /// (the ping probe runs remote commands on an SSH tunnel).
    fn as_any(&self) -> &dyn Any;
}

/// Named tunnel lookup for one supervision epoch.
#[derive(Default)]
pub struct TunnelRegistry {
    inner: Mutex<HashMap<String, Arc<dyn Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel under its unique name.
    pub fn register(&self, tunnel: Arc<dyn Tunnel>) -> Result<(), TunnelError> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let name = tunnel.name().to_string();
        if map.contains_key(&name) {
            return Err(TunnelError::AlreadyRegistered(name));
        }
        map.insert(name, tunnel);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tunnel>> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Stop every tunnel and clear the map. Called on epoch teardown.
    pub async fn stop_all(&self) {
        let tunnels: Vec<Arc<dyn Tunnel>> = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.drain().map(|(_, t)| t).collect()
        };
        for tunnel in tunnels {
            tracing::debug!(tunnel = tunnel.name(), "stopping tunnel");
            tunnel.stop().await;
        }
    }
}
