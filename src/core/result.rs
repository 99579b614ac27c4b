//! The outcome of one probe check.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Result of a single check against one service.
///
/// `pending` and `success` are mutually exclusive: pending means the
/// check is not judgeable yet (tunnel warming up, first handshake
/// outstanding) and must neither alert nor count as healthy.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub success: bool,
    pub pending: bool,
    pub duration: Duration,
    pub message: String,
    /// The specific endpoint that produced this outcome; relevant for
    /// multi-target services where one entry decides the result.
    pub target: String,
    /// Start time of the check.
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    pub fn ok(target: impl Into<String>, duration: Duration, message: impl Into<String>) -> Self {
        Self {
            success: true,
            pending: false,
            duration,
            message: message.into(),
            target: target.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn fail(target: impl Into<String>, duration: Duration, message: impl Into<String>) -> Self {
        Self {
            success: false,
            pending: false,
            duration,
            message: message.into(),
            target: target.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn pending(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            pending: true,
            duration: Duration::ZERO,
            message: message.into(),
            target: target.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }
}
