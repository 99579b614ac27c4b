//! SSH tunnel: dials targets through `direct-tcpip` channels on a
//! cached, lazily established client connection.

use std::any::Any;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use russh::client;
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use tokio::sync::Mutex;

use crate::config::{SshAuthConfig, TunnelKind};
use crate::core::dial::{split_host_port, BoxedStream, NET_TCP};
use crate::core::error::TunnelError;

use super::Tunnel;

/// Host keys are deliberately not verified: the tunnel target is
/// operator-configured and the agent has no key store.
pub(crate) struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub(crate) type SshClient = client::Handle<AcceptingHandler>;

/// Authenticate an established connection with the configured key
/// and/or password. Shared by the tunnel and the ssh probe.
pub(crate) async fn authenticate(
    handle: &mut SshClient,
    auth: &SshAuthConfig,
) -> Result<(), TunnelError> {
    let user = auth.user.clone().unwrap_or_default();
    let mut authenticated = false;

    if let Some(key) = auth.key.as_deref() {
        let key = decode_secret_key(key, None)?;
        let hash = handle.best_supported_rsa_hash().await?.flatten();
        let result = handle
            .authenticate_publickey(&user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
            .await?;
        authenticated = result.success();
    }
    if !authenticated {
        if let Some(password) = auth.password.as_deref() {
            let result = handle.authenticate_password(&user, password).await?;
            authenticated = result.success();
        }
    }
    if !authenticated {
        return Err(TunnelError::SshAuthRejected(user));
    }
    Ok(())
}

/// Establish and authenticate an SSH client connection.
pub(crate) async fn connect_client(
    target: &str,
    auth: &SshAuthConfig,
) -> Result<SshClient, TunnelError> {
    let (host, port) = split_host_port(target, 22);
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, (host.as_str(), port), AcceptingHandler).await?;
    authenticate(&mut handle, auth).await?;
    Ok(handle)
}

pub struct SshTunnel {
    name: String,
    target: String,
    auth: SshAuthConfig,
    client: Mutex<Option<Arc<SshClient>>>,
    init_time: StdMutex<Option<Instant>>,
}

impl SshTunnel {
    pub fn new(name: String, target: String, auth: SshAuthConfig) -> Self {
        Self {
            name,
            target,
            auth,
            client: Mutex::new(None),
            init_time: StdMutex::new(None),
        }
    }

    /// Borrow the cached client, probing it for liveness first; a dead
    /// cache entry is dropped and the connection redialed.
    pub(crate) async fn get_client(&self) -> Result<Arc<SshClient>, TunnelError> {
        let mut slot = self.client.lock().await;
        if let Some(cached) = slot.as_ref() {
            if !cached.is_closed() {
                return Ok(cached.clone());
            }
            tracing::debug!(tunnel = %self.name, "cached ssh client is closed, reconnecting");
            *slot = None;
        }
        let fresh = Arc::new(connect_client(&self.target, &self.auth).await?);
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    async fn invalidate(&self) {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.take() {
            let _ = client
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }

    /// Run a command on the tunnel host, returning its exit status and
    /// combined output. Used by the ping probe's remote fallback.
    pub async fn exec(&self, command: &str) -> Result<(u32, Vec<u8>), TunnelError> {
        let client = self.get_client().await?;
        let mut channel = match client.channel_open_session().await {
            Ok(ch) => ch,
            Err(_) => {
                // One retry on a fresh connection.
                self.invalidate().await;
                let client = self.get_client().await?;
                client.channel_open_session().await?
            }
        };
        channel.exec(true, command).await?;

        let mut output = Vec::new();
        let mut status = 0u32;
        while let Some(msg) = channel.wait().await {
            match msg {
                russh::ChannelMsg::Data { data } => output.extend_from_slice(&data),
                russh::ChannelMsg::ExtendedData { data, .. } => output.extend_from_slice(&data),
                russh::ChannelMsg::ExitStatus { exit_status } => status = exit_status,
                _ => {}
            }
        }
        Ok((status, output))
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TunnelKind {
        TunnelKind::Ssh
    }

    /// The client connection itself is established lazily on first use.
    async fn initialize(&self) -> Result<(), TunnelError> {
        let mut init = self.init_time.lock().unwrap_or_else(|p| p.into_inner());
        if init.is_none() {
            *init = Some(Instant::now());
        }
        Ok(())
    }

    async fn stop(&self) {
        self.invalidate().await;
    }

    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedStream, TunnelError> {
        if network != NET_TCP {
            return Err(TunnelError::UnsupportedNetwork {
                tunnel: self.name.clone(),
                network: network.to_string(),
            });
        }
        let (host, port) = split_host_port(addr, 0);
        if port == 0 {
            return Err(TunnelError::Dial {
                addr: addr.to_string(),
                reason: "address has no port".to_string(),
            });
        }

        let client = self.get_client().await?;
        let channel = match client
            .channel_open_direct_tcpip(&host, u32::from(port), "127.0.0.1", 0)
            .await
        {
            Ok(ch) => ch,
            Err(_) => {
                self.invalidate().await;
                let client = self.get_client().await?;
                client
                    .channel_open_direct_tcpip(&host, u32::from(port), "127.0.0.1", 0)
                    .await?
            }
        };
        Ok(Box::new(channel.into_stream()))
    }

    fn last_init_time(&self) -> Option<Instant> {
        *self.init_time.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// SSH needs no warm-up.
    fn is_stabilized(&self) -> bool {
        true
    }

    fn report_success(&self) {}

    /// Drop the cached client so the next use reconnects.
    async fn report_failure(&self) {
        tracing::info!(tunnel = %self.name, "ssh tunnel failure reported, discarding cached client");
        self.invalidate().await;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stabilized_without_connection() {
        let tunnel = SshTunnel::new(
            "jump".into(),
            "bastion".into(),
            SshAuthConfig::default(),
        );
        assert!(tunnel.is_stabilized());
        assert!(tunnel.last_init_time().is_none());
        tunnel.initialize().await.unwrap();
        assert!(tunnel.last_init_time().is_some());
    }

    #[tokio::test]
    async fn rejects_non_tcp_networks() {
        let tunnel = SshTunnel::new(
            "jump".into(),
            "bastion:22".into(),
            SshAuthConfig::default(),
        );
        let err = match tunnel.dial("ping4", "10.0.0.1:0").await {
            Ok(_) => panic!("expected dial to fail"),
            Err(e) => e,
        };
        assert!(err.is_unsupported_network());
    }
}
