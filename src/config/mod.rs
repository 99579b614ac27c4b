//! Configuration: parsing, defaults, validation, and the shared snapshot.

pub mod duration;
pub mod state;
pub mod types;
pub mod validate;

use std::path::Path;

pub use duration::{format_duration, parse_duration};
pub use state::ConfigState;
pub use types::*;
pub use validate::{validate, ConfigError};

/// Load and validate a config file. The returned snapshot is ready to
/// publish via [`ConfigState::set`].
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_str(&raw)
}

/// Parse and validate config content.
pub fn load_str(raw: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml_ng::from_str(raw)?;
    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MINIMAL: &str = r#"
global:
  default_interval: 30s
services:
  - name: web
    type: http
    url: http://example.com/
    monitor_endpoint:
      success:
        url: http://push.example.com/ok
"#;

    #[test]
    fn minimal_config_loads() {
        let cfg = load_str(MINIMAL).unwrap();
        assert_eq!(cfg.services.len(), 1);
        let svc = &cfg.services[0];
        assert_eq!(svc.name, "web");
        assert_eq!(cfg.effective_interval(svc), Duration::from_secs(30));
        assert_eq!(cfg.effective_timeout(svc), Duration::from_secs(5));
        assert_eq!(cfg.effective_retries(svc), 3);
    }

    #[test]
    fn duplicate_service_names_rejected() {
        let raw = r#"
global:
  default_interval: 30s
services:
  - name: web
    type: http
    url: http://a/
    monitor_endpoint:
      success: { url: "http://push/ok" }
  - name: web
    type: http
    url: http://b/
    monitor_endpoint:
      success: { url: "http://push/ok" }
"#;
        assert!(matches!(
            load_str(raw),
            Err(ConfigError::DuplicateServiceName(_))
        ));
    }

    #[test]
    fn timeout_must_stay_below_interval() {
        let raw = r#"
services:
  - name: slow
    type: tcp
    target: host:80
    interval: 4s
    monitor_endpoint:
      success: { url: "http://push/ok" }
"#;
        // Default 5s timeout vs 4s interval.
        assert!(matches!(
            load_str(raw),
            Err(ConfigError::TimeoutNotBelowInterval { .. })
        ));
    }

    #[test]
    fn missing_success_url_rejected() {
        let raw = r#"
global:
  default_interval: 30s
services:
  - name: web
    type: http
    url: http://a/
    monitor_endpoint:
      success: { url: "" }
"#;
        assert!(matches!(
            load_str(raw),
            Err(ConfigError::MissingSuccessUrl(_))
        ));
    }

    #[test]
    fn empty_rate_limit_rejected_nil_allowed() {
        let with_empty = r#"
global:
  default_interval: 30s
  notifier:
    rate_limit: ""
services: []
"#;
        assert!(matches!(
            load_str(with_empty),
            Err(ConfigError::EmptyRateLimit)
        ));

        let without = "services: []\n";
        assert!(load_str(without).is_ok());

        let zero = r#"
global:
  notifier:
    rate_limit: "0"
services: []
"#;
        let cfg = load_str(zero).unwrap();
        assert_eq!(cfg.notifier_rate_limit(), Some(Duration::ZERO));
    }

    #[test]
    fn wireguard_service_requires_tunnel_xor_inline() {
        let neither = r#"
global:
  default_interval: 30s
services:
  - name: wg
    type: wireguard
    monitor_endpoint:
      success: { url: "http://push/ok" }
"#;
        assert!(matches!(
            load_str(neither),
            Err(ConfigError::WireguardTunnelXorInline(_))
        ));
    }

    #[test]
    fn docker_over_tunnel_requires_tcp_socket() {
        let raw = r#"
global:
  default_interval: 30s
docker-sockets:
  local:
    socket: /var/run/docker.sock
tunnels:
  jump:
    type: ssh
    target: bastion:22
    ssh: { user: probe, password: hunter2 }
services:
  - name: containers
    type: docker
    targets: [app]
    tunnel: jump
    docker: { socket: local }
    monitor_endpoint:
      success: { url: "http://push/ok" }
"#;
        assert!(matches!(
            load_str(raw),
            Err(ConfigError::DockerTunnelRequiresTcp { .. })
        ));
    }

    #[test]
    fn ssh_auth_requires_credentials() {
        let raw = r#"
global:
  default_interval: 30s
services:
  - name: shell
    type: ssh
    target: host:22
    monitor_endpoint:
      success: { url: "http://push/ok" }
"#;
        assert!(matches!(
            load_str(raw),
            Err(ConfigError::SshMissingCredentials(_))
        ));

        let relaxed = r#"
global:
  default_interval: 30s
services:
  - name: shell
    type: ssh
    target: host:22
    ssh: { auth_required: false }
    monitor_endpoint:
      success: { url: "http://push/ok" }
"#;
        assert!(load_str(relaxed).is_ok());
    }
}
