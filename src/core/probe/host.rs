//! Host heartbeat: unconditional success used for agent-liveness pushes.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error::ProbeError;
use crate::core::result::CheckResult;

use super::Probe;

pub struct HostProbe;

#[async_trait]
impl Probe for HostProbe {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn check(
        &self,
        _ctx: &CancellationToken,
        target: &str,
    ) -> Result<CheckResult, ProbeError> {
        Ok(CheckResult::ok(target, Duration::from_millis(1), "OK"))
    }

    fn set_timeout(&mut self, _timeout: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_succeeds_with_fixed_duration() {
        let probe = HostProbe;
        let result = probe.check(&CancellationToken::new(), "").await.unwrap();
        assert!(result.success);
        assert_eq!(result.duration, Duration::from_millis(1));
    }
}
