//! Push notifications for check results.
//!
//! One notifier serves the whole process; its rate gate spaces all
//! outbound pushes regardless of which service produced them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use isahc::config::{Configurable, SslOption};
use isahc::{HttpClient, Request};
use tokio_util::sync::CancellationToken;

use crate::config::{
    EndpointSpec, GlobalConfig, MonitorEndpointConfig, DEFAULT_RATE_LIMIT, DEFAULT_TIMEOUT,
};

use super::error::PushError;
use super::result::CheckResult;

struct Gate {
    rate_limit: Duration,
    /// The instant the most recent push was granted (or reserved).
    last_grant: Option<Instant>,
}

pub struct Notifier {
    client: HttpClient,
    gate: Mutex<Gate>,
}

impl Notifier {
    pub fn new() -> Result<Self, PushError> {
        let client = HttpClient::builder().build().map_err(|e| PushError::Transport {
            url: String::new(),
            reason: format!("building http client: {}", e),
        })?;
        Ok(Self {
            client,
            gate: Mutex::new(Gate {
                rate_limit: DEFAULT_RATE_LIMIT,
                last_grant: None,
            }),
        })
    }

    /// Apply a configured rate limit. `None` keeps the current value;
    /// zero disables the gate.
    pub fn set_rate_limit(&self, rate_limit: Option<Duration>) {
        if let Some(limit) = rate_limit {
            let mut gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
            gate.rate_limit = limit;
        }
    }

    pub fn rate_limit(&self) -> Duration {
        self.gate
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .rate_limit
    }

    /// Deliver one result to the matching endpoint. Pending results are
    /// never pushed by the monitor; this method only sees judged ones.
    pub async fn push(
        &self,
        ctx: &CancellationToken,
        result: &CheckResult,
        endpoint_cfg: &MonitorEndpointConfig,
        global: &GlobalConfig,
    ) -> Result<(), PushError> {
        let endpoint = if result.success {
            Some(&endpoint_cfg.success)
        } else {
            endpoint_cfg.failure.as_ref()
        };
        let Some(endpoint) = endpoint else {
            return Ok(());
        };
        if endpoint.url.is_empty() {
            return Ok(());
        }

        self.wait_for_slot(ctx).await?;

        let url = expand_url(&endpoint.url, result);
        let method = endpoint.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let timeout = endpoint
            .timeout
            .or(endpoint_cfg.timeout)
            .or(global.monitor_endpoint.timeout)
            .unwrap_or(DEFAULT_TIMEOUT);

        let mut builder = Request::builder()
            .method(method.as_str())
            .uri(&url)
            .timeout(timeout);
        if endpoint.insecure_skip_verify {
            builder = builder.ssl_options(
                SslOption::DANGER_ACCEPT_INVALID_CERTS | SslOption::DANGER_ACCEPT_REVOKED_CERTS,
            );
        }
        for (name, value) in merged_headers(global, endpoint_cfg, endpoint) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder.body(()).map_err(|e| PushError::Transport {
            url: url.clone(),
            reason: format!("building request: {}", e),
        })?;

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(PushError::Cancelled),
            response = self.client.send_async(request) => response,
        };
        let response = response.map_err(|e| PushError::Transport {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(PushError::BadStatus { url, status })
        }
    }

    /// Reserve the next send slot and sleep until it arrives. Slots are
    /// spaced at least one rate-limit apart across all callers.
    async fn wait_for_slot(&self, ctx: &CancellationToken) -> Result<(), PushError> {
        let wait = {
            let mut gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
            if gate.rate_limit.is_zero() {
                gate.last_grant = Some(Instant::now());
                Duration::ZERO
            } else {
                let now = Instant::now();
                let slot = gate
                    .last_grant
                    .map(|last| (last + gate.rate_limit).max(now))
                    .unwrap_or(now);
                gate.last_grant = Some(slot);
                slot.saturating_duration_since(now)
            }
        };
        if wait.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = ctx.cancelled() => Err(PushError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}

/// Literal token substitution on the endpoint URL.
fn expand_url(template: &str, result: &CheckResult) -> String {
    let escape = |s: &str| -> String {
        url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
    };
    let error = if result.success { String::new() } else { escape(&result.message) };
    template
        .replace("{%duration%}", &result.duration.as_millis().to_string())
        .replace("{%error%}", &error)
        .replace("{%message%}", &escape(&result.message))
        .replace("{%target%}", &escape(&result.target))
        .replace("{%timestamp%}", &result.timestamp.timestamp().to_string())
        .replace("{%success%}", if result.success { "true" } else { "false" })
}

/// global common -> service common -> endpoint, later wins.
fn merged_headers(
    global: &GlobalConfig,
    endpoint_cfg: &MonitorEndpointConfig,
    endpoint: &EndpointSpec,
) -> HashMap<String, String> {
    let mut headers = global.monitor_endpoint.headers.clone();
    headers.extend(endpoint_cfg.headers.clone());
    headers.extend(endpoint.headers.clone());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommonEndpointConfig;

    fn result_ok() -> CheckResult {
        let mut r = CheckResult::ok("db:5432", Duration::from_millis(150), "Test OK");
        r.timestamp = chrono::Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .unwrap();
        r
    }

    use chrono::TimeZone;

    #[test]
    fn expands_all_tokens() {
        let url = expand_url(
            "http://x/a?d={%duration%}&ok={%success%}&m={%message%}&t={%target%}&ts={%timestamp%}&e={%error%}",
            &result_ok(),
        );
        assert_eq!(
            url,
            "http://x/a?d=150&ok=true&m=Test+OK&t=db%3A5432&ts=1714564800&e="
        );
    }

    #[test]
    fn error_token_set_only_on_failure() {
        let failure = CheckResult::fail("t", Duration::from_millis(10), "went wrong");
        let url = expand_url("http://x/?e={%error%}", &failure);
        assert_eq!(url, "http://x/?e=went+wrong");
    }

    #[test]
    fn header_merge_order() {
        let global = GlobalConfig {
            monitor_endpoint: CommonEndpointConfig {
                headers: [
                    ("authorization".to_string(), "global".to_string()),
                    ("x-global".to_string(), "1".to_string()),
                ]
                .into(),
                timeout: None,
            },
            ..GlobalConfig::default()
        };
        let endpoint = EndpointSpec {
            url: "http://push/".to_string(),
            headers: [("authorization".to_string(), "endpoint".to_string())].into(),
            ..EndpointSpec::default()
        };
        let cfg = MonitorEndpointConfig {
            success: endpoint.clone(),
            failure: None,
            headers: [
                ("authorization".to_string(), "service".to_string()),
                ("x-service".to_string(), "1".to_string()),
            ]
            .into(),
            timeout: None,
        };
        let merged = merged_headers(&global, &cfg, &endpoint);
        assert_eq!(merged["authorization"], "endpoint");
        assert_eq!(merged["x-global"], "1");
        assert_eq!(merged["x-service"], "1");
    }

    #[tokio::test]
    async fn rate_gate_spaces_grants() {
        let notifier = Notifier::new().unwrap();
        notifier.set_rate_limit(Some(Duration::from_millis(50)));
        let ctx = CancellationToken::new();

        let started = Instant::now();
        for _ in 0..3 {
            notifier.wait_for_slot(&ctx).await.unwrap();
        }
        // Three grants need at least two full rate-limit gaps.
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn zero_rate_limit_disables_gate() {
        let notifier = Notifier::new().unwrap();
        notifier.set_rate_limit(Some(Duration::ZERO));
        let ctx = CancellationToken::new();
        let started = Instant::now();
        for _ in 0..10 {
            notifier.wait_for_slot(&ctx).await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn none_preserves_existing_rate_limit() {
        let notifier = Notifier::new().unwrap();
        notifier.set_rate_limit(Some(Duration::from_millis(250)));
        notifier.set_rate_limit(None);
        assert_eq!(notifier.rate_limit(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn gate_wait_is_cancellable() {
        let notifier = Notifier::new().unwrap();
        notifier.set_rate_limit(Some(Duration::from_secs(30)));
        let ctx = CancellationToken::new();
        // Consume the free first slot.
        notifier.wait_for_slot(&ctx).await.unwrap();

        ctx.cancel();
        let err = notifier.wait_for_slot(&ctx).await.unwrap_err();
        assert!(matches!(err, PushError::Cancelled));
    }

    #[tokio::test]
    async fn missing_failure_endpoint_is_silent() {
        let notifier = Notifier::new().unwrap();
        let cfg = MonitorEndpointConfig {
            success: EndpointSpec {
                url: "http://push/ok".to_string(),
                ..EndpointSpec::default()
            },
            failure: None,
            headers: HashMap::new(),
            timeout: None,
        };
        let failure = CheckResult::fail("t", Duration::ZERO, "down");
        let outcome = notifier
            .push(
                &CancellationToken::new(),
                &failure,
                &cfg,
                &GlobalConfig::default(),
            )
            .await;
        assert!(outcome.is_ok());
    }
}
