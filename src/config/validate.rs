//! Cross-validation of a parsed [`Config`].
//!
//! Every rule is its own [`ConfigError`] variant so callers and logs can
//! tell failures apart. A config that passes [`validate`] is safe to
//! publish as a snapshot.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;

use super::duration::{format_duration, parse_duration};
use super::types::{Config, ServiceKind, ServiceSpec, TunnelKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("service without a name")]
    MissingServiceName,
    #[error("duplicate service name {0:?}")]
    DuplicateServiceName(String),
    #[error("service {0:?}: no interval set and no global default_interval")]
    MissingInterval(String),
    #[error("service {0:?}: monitor_endpoint.success.url is required")]
    MissingSuccessUrl(String),
    #[error("service {service:?}: timeout {timeout} must be shorter than interval {interval}")]
    TimeoutNotBelowInterval {
        service: String,
        timeout: String,
        interval: String,
    },
    #[error("service {0:?}: http services need a url")]
    MissingUrl(String),
    #[error("service {0:?}: tls services need a tls block with certificate_expiry")]
    MissingCertificateExpiry(String),
    #[error("service {0:?}: no targets configured")]
    MissingTargets(String),
    #[error("service {0:?}: docker services need docker.socket")]
    MissingDockerSocket(String),
    #[error("service {service:?}: docker socket {socket:?} is not declared under docker-sockets")]
    UnknownDockerSocket { service: String, socket: String },
    #[error("service {service:?}: docker over a tunnel needs a TCP socket, {socket:?} is a unix socket")]
    DockerTunnelRequiresTcp { service: String, socket: String },
    #[error("service {0:?}: wireguard services need either a wireguard tunnel reference or an inline wireguard config, not both")]
    WireguardTunnelXorInline(String),
    #[error("service {0:?}: wireguard.max_age is required")]
    MissingWireguardMaxAge(String),
    #[error("service {0:?}: wireguard.restart_threshold must be positive")]
    InvalidRestartThreshold(String),
    #[error("service {service:?}: tunnel {tunnel:?} is not a wireguard tunnel")]
    WireguardTunnelKindMismatch { service: String, tunnel: String },
    #[error("service {0:?}: ssh services need a target or a tunnel")]
    SshMissingTarget(String),
    #[error("service {0:?}: ssh services take a single target, not a targets list")]
    SshTargetsForbidden(String),
    #[error("service {0:?}: ssh auth requires user and a password or key")]
    SshMissingCredentials(String),
    #[error("service {service:?}: invalid ssh private key: {reason}")]
    SshInvalidKey { service: String, reason: String },
    #[error("service {service:?}: unknown tunnel {tunnel:?}")]
    UnknownTunnel { service: String, tunnel: String },

    #[error("tunnel {0:?}: ssh tunnels need a target")]
    TunnelMissingTarget(String),
    #[error("tunnel {0:?}: ssh tunnels need an ssh block with user and a password or key")]
    TunnelMissingSshAuth(String),
    #[error("tunnel {tunnel:?}: invalid ssh private key: {reason}")]
    TunnelInvalidKey { tunnel: String, reason: String },
    #[error("tunnel {tunnel:?}: wireguard tunnels need {field}")]
    TunnelMissingWireguardField {
        tunnel: String,
        field: &'static str,
    },

    #[error("notifier.rate_limit must not be an empty string")]
    EmptyRateLimit,
    #[error("notifier.rate_limit {0:?} does not parse as a duration")]
    InvalidRateLimit(String),
}

pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    validate_notifier(cfg)?;
    validate_tunnels(cfg)?;

    let mut seen = HashSet::new();
    for svc in &cfg.services {
        if svc.name.trim().is_empty() {
            return Err(ConfigError::MissingServiceName);
        }
        if !seen.insert(svc.name.clone()) {
            return Err(ConfigError::DuplicateServiceName(svc.name.clone()));
        }
        validate_service(cfg, svc)?;
    }
    Ok(())
}

fn validate_notifier(cfg: &Config) -> Result<(), ConfigError> {
    match cfg.global.notifier.rate_limit.as_deref() {
        None => Ok(()),
        Some("") => Err(ConfigError::EmptyRateLimit),
        Some(raw) => {
            parse_duration(raw)
                .map_err(|_| ConfigError::InvalidRateLimit(raw.to_string()))?;
            Ok(())
        }
    }
}

fn validate_tunnels(cfg: &Config) -> Result<(), ConfigError> {
    for (name, spec) in &cfg.tunnels {
        match spec.kind {
            TunnelKind::Ssh => {
                if spec.target.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::TunnelMissingTarget(name.clone()));
                }
                let auth = spec
                    .ssh
                    .as_ref()
                    .ok_or_else(|| ConfigError::TunnelMissingSshAuth(name.clone()))?;
                let has_user = auth.user.as_deref().map_or(false, |u| !u.is_empty());
                let has_secret = auth.password.is_some() || auth.key.is_some();
                if !has_user || !has_secret {
                    return Err(ConfigError::TunnelMissingSshAuth(name.clone()));
                }
                if let Some(key) = auth.key.as_deref() {
                    russh::keys::decode_secret_key(key, None).map_err(|e| {
                        ConfigError::TunnelInvalidKey {
                            tunnel: name.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
            }
            TunnelKind::Wireguard => {
                let wg = spec.wireguard.as_ref().ok_or(
                    ConfigError::TunnelMissingWireguardField {
                        tunnel: name.clone(),
                        field: "a wireguard block",
                    },
                )?;
                for (field, present) in [
                    ("wireguard.endpoint", wg.endpoint.is_some()),
                    ("wireguard.public_key", wg.public_key.is_some()),
                    ("wireguard.private_key", wg.private_key.is_some()),
                    ("wireguard.addresses", !wg.addresses.is_empty()),
                ] {
                    if !present {
                        return Err(ConfigError::TunnelMissingWireguardField {
                            tunnel: name.clone(),
                            field,
                        });
                    }
                }
                if wg.restart_threshold == Some(0) {
                    return Err(ConfigError::InvalidRestartThreshold(name.clone()));
                }
            }
        }
    }
    Ok(())
}

fn validate_service(cfg: &Config, svc: &ServiceSpec) -> Result<(), ConfigError> {
    let name = svc.name.clone();

    let interval = svc
        .interval
        .or(cfg.global.default_interval)
        .ok_or_else(|| ConfigError::MissingInterval(name.clone()))?;

    if svc.monitor_endpoint.success.url.is_empty() {
        return Err(ConfigError::MissingSuccessUrl(name));
    }

    let timeout = cfg.effective_timeout(svc);
    if timeout >= interval {
        return Err(ConfigError::TimeoutNotBelowInterval {
            service: name,
            timeout: format_duration(timeout),
            interval: format_duration(interval),
        });
    }

    if let Some(tunnel) = svc.tunnel.as_deref() {
        if !cfg.tunnels.contains_key(tunnel) {
            return Err(ConfigError::UnknownTunnel {
                service: svc.name.clone(),
                tunnel: tunnel.to_string(),
            });
        }
    }

    match svc.kind {
        ServiceKind::Http => validate_http(svc),
        ServiceKind::Tls => validate_tls(svc),
        ServiceKind::Tcp | ServiceKind::Udp | ServiceKind::Dns | ServiceKind::Ping => {
            validate_targets(svc)
        }
        ServiceKind::Docker => validate_docker(cfg, svc),
        ServiceKind::Wireguard => validate_wireguard(cfg, svc),
        ServiceKind::Ssh => validate_ssh(svc),
        ServiceKind::Host => Ok(()),
    }
}

fn validate_http(svc: &ServiceSpec) -> Result<(), ConfigError> {
    if svc.resolved_target().is_empty() {
        return Err(ConfigError::MissingUrl(svc.name.clone()));
    }
    Ok(())
}

fn validate_tls(svc: &ServiceSpec) -> Result<(), ConfigError> {
    if svc.resolved_target().is_empty() {
        return Err(ConfigError::MissingUrl(svc.name.clone()));
    }
    let expiry = svc.tls.as_ref().and_then(|t| t.certificate_expiry);
    if expiry.map_or(true, |d| d.is_zero()) {
        return Err(ConfigError::MissingCertificateExpiry(svc.name.clone()));
    }
    Ok(())
}

fn validate_targets(svc: &ServiceSpec) -> Result<(), ConfigError> {
    if svc.resolved_target().is_empty() {
        return Err(ConfigError::MissingTargets(svc.name.clone()));
    }
    Ok(())
}

fn validate_docker(cfg: &Config, svc: &ServiceSpec) -> Result<(), ConfigError> {
    let socket_name = svc
        .docker
        .as_ref()
        .and_then(|d| d.socket.as_deref())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingDockerSocket(svc.name.clone()))?;
    let socket = cfg.docker_sockets.get(socket_name).ok_or_else(|| {
        ConfigError::UnknownDockerSocket {
            service: svc.name.clone(),
            socket: socket_name.to_string(),
        }
    })?;
    if svc.tunnel.is_some() && socket.is_unix() {
        return Err(ConfigError::DockerTunnelRequiresTcp {
            service: svc.name.clone(),
            socket: socket_name.to_string(),
        });
    }
    validate_targets(svc)
}

fn validate_wireguard(cfg: &Config, svc: &ServiceSpec) -> Result<(), ConfigError> {
    let inline = svc
        .wireguard
        .as_ref()
        .filter(|wg| wg.endpoint.is_some() || wg.private_key.is_some());
    match (svc.tunnel.as_deref(), inline) {
        (Some(tunnel), None) => {
            // Checked above for existence; here for kind.
            if let Some(spec) = cfg.tunnels.get(tunnel) {
                if spec.kind != TunnelKind::Wireguard {
                    return Err(ConfigError::WireguardTunnelKindMismatch {
                        service: svc.name.clone(),
                        tunnel: tunnel.to_string(),
                    });
                }
            }
        }
        (None, Some(wg)) => {
            for (field, present) in [
                ("wireguard.endpoint", wg.endpoint.is_some()),
                ("wireguard.public_key", wg.public_key.is_some()),
                ("wireguard.private_key", wg.private_key.is_some()),
                ("wireguard.addresses", !wg.addresses.is_empty()),
            ] {
                if !present {
                    return Err(ConfigError::TunnelMissingWireguardField {
                        tunnel: svc.name.clone(),
                        field,
                    });
                }
            }
        }
        _ => return Err(ConfigError::WireguardTunnelXorInline(svc.name.clone())),
    }

    let max_age = svc.wireguard.as_ref().and_then(|wg| wg.max_age);
    if max_age.map_or(true, |d| d == Duration::ZERO) {
        return Err(ConfigError::MissingWireguardMaxAge(svc.name.clone()));
    }
    if svc.wireguard.as_ref().and_then(|wg| wg.restart_threshold) == Some(0) {
        return Err(ConfigError::InvalidRestartThreshold(svc.name.clone()));
    }
    Ok(())
}

fn validate_ssh(svc: &ServiceSpec) -> Result<(), ConfigError> {
    if !svc.targets.is_empty() {
        return Err(ConfigError::SshTargetsForbidden(svc.name.clone()));
    }
    if svc.target.as_deref().map_or(true, str::is_empty) && svc.tunnel.is_none() {
        return Err(ConfigError::SshMissingTarget(svc.name.clone()));
    }
    let auth = svc.ssh.clone().unwrap_or_default();
    if auth.auth_required() {
        let has_user = auth.user.as_deref().map_or(false, |u| !u.is_empty());
        let has_secret = auth.password.is_some() || auth.key.is_some();
        if !has_user || !has_secret {
            return Err(ConfigError::SshMissingCredentials(svc.name.clone()));
        }
        if let Some(key) = auth.key.as_deref() {
            russh::keys::decode_secret_key(key, None).map_err(|e| ConfigError::SshInvalidKey {
                service: svc.name.clone(),
                reason: e.to_string(),
            })?;
        }
    }
    Ok(())
}
