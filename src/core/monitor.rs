//! Per-service check loop.
//!
//! One monitor task per service per epoch: immediate check, then ticks
//! at the resolved interval. Each tick re-reads the config snapshot,
//! applies the retry policy, and pushes exactly one judged result.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ConfigState;

use super::notifier::Notifier;
use super::probe::Probe;
use super::result::CheckResult;
use super::tunnel::TunnelRegistry;

pub struct ServiceMonitor {
    service_name: String,
    probe: Arc<dyn Probe>,
    config_state: Arc<ConfigState>,
    registry: Arc<TunnelRegistry>,
    notifier: Arc<Notifier>,
}

impl ServiceMonitor {
    pub fn new(
        service_name: String,
        probe: Arc<dyn Probe>,
        config_state: Arc<ConfigState>,
        registry: Arc<TunnelRegistry>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            service_name,
            probe,
            config_state,
            registry,
            notifier,
        }
    }

    /// Run until `ctx` cancels. A fresh tick cancels a check that is
    /// still in flight from the previous one.
    pub async fn run(self, ctx: CancellationToken) {
        let mut inflight: Option<(CancellationToken, tokio::task::JoinHandle<()>)> = None;

        loop {
            // Per-service single-flight: reissue cancels the old check.
            if let Some((token, handle)) = inflight.take() {
                if !handle.is_finished() {
                    tracing::debug!(
                        service = %self.service_name,
                        "previous check still running, cancelling it"
                    );
                }
                token.cancel();
                let _ = handle.await;
            }

            let interval = {
                let snapshot = self.config_state.get();
                match snapshot.service(&self.service_name) {
                    Some(svc) => snapshot.effective_interval(svc),
                    // The service vanished from the snapshot: a reload
                    // is about to replace this monitor.
                    None => Duration::from_secs(1),
                }
            };

            let check_ctx = ctx.child_token();
            let task = tokio::spawn(Self::run_check(
                self.service_name.clone(),
                self.probe.clone(),
                self.config_state.clone(),
                self.registry.clone(),
                self.notifier.clone(),
                check_ctx.clone(),
            ));
            inflight = Some((check_ctx, task));

            tokio::select! {
                _ = ctx.cancelled() => {
                    if let Some((token, handle)) = inflight.take() {
                        token.cancel();
                        let _ = handle.await;
                    }
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn run_check(
        service_name: String,
        probe: Arc<dyn Probe>,
        config_state: Arc<ConfigState>,
        registry: Arc<TunnelRegistry>,
        notifier: Arc<Notifier>,
        ctx: CancellationToken,
    ) {
        let snapshot = config_state.get();
        let Some(svc) = snapshot.service(&service_name) else {
            return;
        };
        let retries = snapshot.effective_retries(svc);
        let target = svc.resolved_target();

        let mut result: Option<CheckResult> = None;
        for attempt in 0..=retries {
            if ctx.is_cancelled() {
                return;
            }
            match probe.check(&ctx, &target).await {
                Ok(r) => {
                    let judged_up = r.success && !r.pending;
                    let pending = r.pending;
                    result = Some(r);
                    // Pending means "not judgeable yet", retrying would
                    // not change that within this tick.
                    if judged_up || pending {
                        break;
                    }
                    if attempt < retries {
                        tracing::debug!(
                            service = %service_name,
                            attempt = attempt + 1,
                            "check failed, retrying"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(service = %service_name, "probe error: {}", e);
                    result = Some(CheckResult::fail(&target, Duration::ZERO, e.to_string()));
                    break;
                }
            }
        }
        let Some(result) = result else { return };
        if ctx.is_cancelled() {
            return;
        }

        if result.success {
            if let Some(tunnel_name) = svc.tunnel.as_deref() {
                if let Some(tunnel) = registry.get(tunnel_name) {
                    tunnel.report_success();
                }
            }
        }

        if result.pending {
            tracing::debug!(
                service = %service_name,
                message = %result.message,
                "check pending, no notification"
            );
            return;
        }

        tracing::info!(
            service = %service_name,
            success = result.success,
            duration_ms = result.duration.as_millis() as u64,
            message = %result.message,
            "check finished"
        );
        if let Err(e) = notifier
            .push(&ctx, &result, &svc.monitor_endpoint, &snapshot.global)
            .await
        {
            tracing::warn!(service = %service_name, "push failed: {}", e);
        }
    }
}
