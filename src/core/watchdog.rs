//! Supervisor: owns the tunnel plane and the monitor plane, rebuilding
//! both on every reload epoch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config, ConfigState, TunnelKind};

use super::factory::setup_probe;
use super::monitor::ServiceMonitor;
use super::notifier::Notifier;
use super::probe::Probe;
use super::tunnel::{SshTunnel, Tunnel, TunnelRegistry, WireguardTunnel};

/// Extra slack added on top of `interval x restart_threshold` when the
/// watchdog computes a wireguard tunnel's success window.
const SUCCESS_WINDOW_SLACK: Duration = Duration::from_secs(60);

pub struct Watchdog {
    config_path: PathBuf,
    config_state: Arc<ConfigState>,
    notifier: Arc<Notifier>,
    starting_window: Duration,
}

impl Watchdog {
    pub fn new(
        config_path: PathBuf,
        config_state: Arc<ConfigState>,
        notifier: Arc<Notifier>,
        starting_window: Duration,
    ) -> Self {
        Self {
            config_path,
            config_state,
            notifier,
            starting_window,
        }
    }

    pub fn config_state(&self) -> Arc<ConfigState> {
        self.config_state.clone()
    }

    /// Run until `ctx` cancels: spawn the file watcher, then loop
    /// supervision epochs.
    pub async fn start(&self, ctx: CancellationToken) {
        self.notifier
            .set_rate_limit(self.config_state.get().notifier_rate_limit());

        let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
        let watcher_task = tokio::spawn(watch_config(
            self.config_path.clone(),
            self.config_state.clone(),
            self.notifier.clone(),
            reload_tx,
            ctx.clone(),
        ));

        let mut registry = Arc::new(TunnelRegistry::new());
        loop {
            let snapshot = self.config_state.get();
            let monitor_ctx = ctx.child_token();

            // Rebuild the tunnel plane for this epoch.
            registry.stop_all().await;
            registry = Arc::new(TunnelRegistry::new());
            build_tunnels(&snapshot, &registry).await;
            apply_success_windows(&snapshot, &registry);

            // Build probes; a failing factory skips only that service.
            let mut planned: Vec<(String, Arc<dyn Probe>)> = Vec::new();
            for svc in &snapshot.services {
                match setup_probe(&snapshot, svc, &registry).await {
                    Ok(probe) => planned.push((svc.name.clone(), Arc::from(probe))),
                    Err(e) => {
                        tracing::error!(service = %svc.name, "skipping service: {}", e)
                    }
                }
            }

            if !self.starting_window.is_zero() {
                tracing::info!(
                    "waiting {}s before starting monitors",
                    self.starting_window.as_secs()
                );
                tokio::select! {
                    _ = monitor_ctx.cancelled() => {}
                    _ = tokio::time::sleep(self.starting_window) => {}
                }
            }

            let mut handles = Vec::with_capacity(planned.len());
            for (name, probe) in planned {
                let monitor = ServiceMonitor::new(
                    name,
                    probe,
                    self.config_state.clone(),
                    registry.clone(),
                    self.notifier.clone(),
                );
                handles.push(tokio::spawn(monitor.run(monitor_ctx.clone())));
            }
            tracing::info!(monitors = handles.len(), "supervision epoch started");

            let reload = tokio::select! {
                _ = ctx.cancelled() => false,
                _ = reload_rx.recv() => true,
            };

            monitor_ctx.cancel();
            for handle in handles {
                let _ = handle.await;
            }

            if !reload {
                break;
            }
            tracing::info!("rebuilding monitor plane after reload");
        }

        registry.stop_all().await;
        let _ = watcher_task.await;
        tracing::info!("watchdog stopped");
    }
}

async fn build_tunnels(cfg: &Config, registry: &TunnelRegistry) {
    for (name, spec) in &cfg.tunnels {
        let tunnel: Arc<dyn Tunnel> = match spec.kind {
            TunnelKind::Ssh => Arc::new(SshTunnel::new(
                name.clone(),
                spec.target.clone().unwrap_or_default(),
                spec.ssh.clone().unwrap_or_default(),
            )),
            TunnelKind::Wireguard => Arc::new(WireguardTunnel::new(
                name.clone(),
                spec.wireguard.clone().unwrap_or_default(),
            )),
        };
        if let Err(e) = tunnel.initialize().await {
            // Stays registered; probes report pending until it comes up.
            tracing::error!(tunnel = %name, "tunnel initialization failed: {}", e);
        }
        if let Err(e) = registry.register(tunnel) {
            tracing::error!(tunnel = %name, "registration failed: {}", e);
        }
    }
}

/// successWindow = max referencing-service interval x restart_threshold
/// + slack.
fn apply_success_windows(cfg: &Config, registry: &TunnelRegistry) {
    for (name, spec) in &cfg.tunnels {
        if spec.kind != TunnelKind::Wireguard {
            continue;
        }
        let max_interval = cfg
            .services
            .iter()
            .filter(|svc| svc.tunnel.as_deref() == Some(name.as_str()))
            .map(|svc| cfg.effective_interval(svc))
            .max()
            .unwrap_or(Duration::ZERO);
        let threshold = spec
            .wireguard
            .as_ref()
            .and_then(|wg| wg.restart_threshold)
            .unwrap_or(1);
        let window = max_interval * threshold + SUCCESS_WINDOW_SLACK;
        if let Some(tunnel) = registry.get(name) {
            tunnel.set_success_window(window);
        }
    }
}

/// Debounced config file watcher: write events arm a timer; when it
/// fires, the file is reloaded and, only if valid, published.
async fn watch_config(
    path: PathBuf,
    config_state: Arc<ConfigState>,
    notifier: Arc<Notifier>,
    reload_tx: mpsc::Sender<()>,
    ctx: CancellationToken,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = match notify::recommended_watcher(
        move |event: Result<notify::Event, notify::Error>| {
            let _ = event_tx.send(event);
        },
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!("config watcher unavailable: {}", e);
            return;
        }
    };

    // Watch the parent directory so rename-replace saves keep working.
    let watch_root = path.parent().filter(|p| !p.as_os_str().is_empty());
    let watch_target = watch_root.unwrap_or(path.as_path());
    if let Err(e) = watcher.watch(watch_target, RecursiveMode::NonRecursive) {
        tracing::error!("cannot watch {}: {}", watch_target.display(), e);
        return;
    }

    let mut deadline: Option<tokio::time::Instant> = None;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            event = event_rx.recv() => {
                match event {
                    None => return,
                    Some(Err(e)) => tracing::warn!("config watcher error: {}", e),
                    Some(Ok(event)) => {
                        if is_config_write(&event, &path) {
                            let delay = config_state.get().reload_delay();
                            // Each write resets the single debounce timer.
                            deadline = Some(tokio::time::Instant::now() + delay);
                        }
                    }
                }
            }
            _ = sleep_until_opt(deadline), if deadline.is_some() => {
                deadline = None;
                match config::load_file(&path) {
                    Ok(cfg) => {
                        let rate_limit = cfg.notifier_rate_limit();
                        config_state.set(cfg);
                        notifier.set_rate_limit(rate_limit);
                        let _ = reload_tx.try_send(());
                        tracing::info!("configuration reloaded");
                    }
                    Err(e) => {
                        tracing::error!("reload failed, keeping previous config: {}", e)
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn is_config_write(event: &notify::Event, config_path: &Path) -> bool {
    if !matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    ) {
        return false;
    }
    let file_name = config_path.file_name();
    event
        .paths
        .iter()
        .any(|p| p.file_name() == file_name || p == config_path)
}
