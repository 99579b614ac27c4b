//! Configuration data model.
//!
//! One [`Config`] is an immutable snapshot of the whole agent
//! configuration. Snapshots are produced by [`crate::config::load_file`],
//! validated once, and then only ever read.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use super::duration;

/// Default push rate limit when the config does not set one.
pub const DEFAULT_RATE_LIMIT: Duration = Duration::from_millis(100);
/// Default per-probe and push timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default check interval when neither the service nor global sets one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
/// Default retry count resolved when neither service nor global sets one.
pub const DEFAULT_RETRIES: u32 = 3;
/// Default debounce window between a config write and the reload attempt.
pub const DEFAULT_RELOAD_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default, rename = "docker-sockets")]
    pub docker_sockets: HashMap<String, DockerSocketSpec>,
    #[serde(default)]
    pub tunnels: HashMap<String, TunnelSpec>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub default_interval: Option<Duration>,
    #[serde(default)]
    pub monitor_endpoint: CommonEndpointConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Debounce between a config file write and the reload attempt.
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub reload_delay: Option<Duration>,
}

/// Headers and timeout shared by every monitor endpoint at one layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommonEndpointConfig {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifierConfig {
    /// Raw string so the validator can tell "absent" from "empty".
    /// `"0"` disables the gate.
    pub rate_limit: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerSocketSpec {
    /// Unix domain socket path. Mutually exclusive with host/port.
    pub socket: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// "http" (default) or "https" for TCP sockets.
    pub protocol: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl DockerSocketSpec {
    pub fn is_unix(&self) -> bool {
        self.socket.is_some()
    }

    /// host:port address for TCP sockets.
    pub fn tcp_addr(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(format!("{}:{}", host, self.port.unwrap_or(2375)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Ssh,
    Wireguard,
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelKind::Ssh => write!(f, "ssh"),
            TunnelKind::Wireguard => write!(f, "wireguard"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSpec {
    #[serde(rename = "type")]
    pub kind: TunnelKind,
    /// SSH only: "host" or "host:port" of the jump host.
    pub target: Option<String>,
    pub ssh: Option<SshAuthConfig>,
    pub wireguard: Option<WireguardConfig>,
}

/// SSH credentials shared by the ssh tunnel and the ssh probe.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshAuthConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    /// PEM-encoded private key.
    pub key: Option<String>,
    /// Only honored by the ssh probe; defaults to true.
    pub auth_required: Option<bool>,
}

impl SshAuthConfig {
    pub fn auth_required(&self) -> bool {
        self.auth_required.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireguardConfig {
    /// "host:port" of the WireGuard peer.
    pub endpoint: Option<String>,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub preshared_key: Option<String>,
    /// Local addresses; the first one becomes the stack's IP.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub persistent_keepalive: Option<Duration>,
    /// Maximum tolerated handshake age for the wireguard probe.
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub max_age: Option<Duration>,
    /// Multiplier on the referencing services' interval when the
    /// watchdog computes the tunnel's success window.
    pub restart_threshold: Option<u32>,
}

impl WireguardConfig {
    pub fn keepalive(&self) -> Duration {
        self.persistent_keepalive
            .unwrap_or(Duration::from_secs(25))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Http,
    Tcp,
    Udp,
    Dns,
    Ping,
    Host,
    Docker,
    Wireguard,
    Tls,
    Ssh,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceKind::Http => "http",
            ServiceKind::Tcp => "tcp",
            ServiceKind::Udp => "udp",
            ServiceKind::Dns => "dns",
            ServiceKind::Ping => "ping",
            ServiceKind::Host => "host",
            ServiceKind::Docker => "docker",
            ServiceKind::Wireguard => "wireguard",
            ServiceKind::Tls => "tls",
            ServiceKind::Ssh => "ssh",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    /// First succeeding target wins.
    #[default]
    Any,
    /// Every target must succeed.
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub target: Option<String>,
    /// Alias used by http services.
    pub url: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    /// Name of a tunnel from the top-level `tunnels` map.
    pub tunnel: Option<String>,
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub interval: Option<Duration>,
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    #[serde(default)]
    pub target_mode: TargetMode,

    pub http: Option<HttpOptions>,
    pub dns: Option<DnsOptions>,
    pub tls: Option<TlsOptions>,
    pub ssh: Option<SshAuthConfig>,
    pub docker: Option<DockerOptions>,
    pub wireguard: Option<WireguardConfig>,

    #[serde(default)]
    pub monitor_endpoint: MonitorEndpointConfig,
}

impl ServiceSpec {
    /// target -> url -> comma-joined targets, the resolution order the
    /// monitor uses on every tick.
    pub fn resolved_target(&self) -> String {
        if let Some(t) = self.target.as_deref() {
            if !t.is_empty() {
                return t.to_string();
            }
        }
        if let Some(u) = self.url.as_deref() {
            if !u.is_empty() {
                return u.to_string();
            }
        }
        self.targets.join(",")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpOptions {
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Items are single codes ("404") or inclusive ranges ("200-204").
    #[serde(default)]
    pub accepted_status_codes: Vec<String>,
    #[serde(default)]
    pub match_data: Vec<MatchExpectation>,
    /// When set and the connection is TLS, certificates closer to expiry
    /// than this fail the check.
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub expiry_threshold: Option<Duration>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// One response expectation evaluated after the status check passes.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchExpectation {
    /// Where the actual value comes from.
    #[serde(rename = "type")]
    pub source: MatchSource,
    /// Header name or JSON path; unused for body.
    pub selector: Option<String>,
    pub op: MatchOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Body,
    Header,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MatchOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "matches")]
    Matches,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">")]
    Greater,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsOptions {
    /// Domain looked up against the target name server.
    pub domain: Option<String>,
}

impl DnsOptions {
    pub fn domain(&self) -> &str {
        self.domain.as_deref().unwrap_or("google.com")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsOptions {
    /// Certificates expiring within this window fail the check.
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub certificate_expiry: Option<Duration>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerOptions {
    /// Name of an entry in the top-level `docker-sockets` map.
    pub socket: Option<String>,
    /// Require State.Health.Status == "healthy" when a healthcheck exists.
    #[serde(default)]
    pub healthy: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorEndpointConfig {
    #[serde(default)]
    pub success: EndpointSpec,
    pub failure: Option<EndpointSpec>,
    /// Shared by both endpoints, overridden by endpoint headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSpec {
    #[serde(default)]
    pub url: String,
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default, deserialize_with = "duration::de_opt")]
    pub timeout: Option<Duration>,
}

impl Config {
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// service interval -> global default_interval -> 60s.
    pub fn effective_interval(&self, svc: &ServiceSpec) -> Duration {
        svc.interval
            .or(self.global.default_interval)
            .unwrap_or(DEFAULT_INTERVAL)
    }

    /// service timeout -> 5s.
    pub fn effective_timeout(&self, svc: &ServiceSpec) -> Duration {
        svc.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// service retries -> global monitor retries -> 3; host and
    /// wireguard checks never retry.
    pub fn effective_retries(&self, svc: &ServiceSpec) -> u32 {
        match svc.kind {
            ServiceKind::Host | ServiceKind::Wireguard => 0,
            _ => svc
                .retries
                .or(self.global.monitor.retries)
                .unwrap_or(DEFAULT_RETRIES),
        }
    }

    pub fn reload_delay(&self) -> Duration {
        self.global.reload_delay.unwrap_or(DEFAULT_RELOAD_DELAY)
    }

    /// Parsed notifier rate limit; `None` when the config leaves it alone.
    pub fn notifier_rate_limit(&self) -> Option<Duration> {
        let raw = self.global.notifier.rate_limit.as_deref()?;
        super::duration::parse_duration(raw).ok()
    }
}
