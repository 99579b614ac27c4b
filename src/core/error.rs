//! Error taxonomy for the monitor plane.

use thiserror::Error;

/// Tunnel lifecycle and dialing failures.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel initialization failed: {0}")]
    Init(String),
    #[error("tunnel {tunnel:?} cannot dial {network} connections")]
    UnsupportedNetwork { tunnel: String, network: String },
    #[error("tunnel {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("tunnel is not connected")]
    NotConnected,
    #[error("dial {addr} failed: {reason}")]
    Dial { addr: String, reason: String },
    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),
    #[error("ssh key: {0}")]
    SshKey(#[from] russh::keys::Error),
    #[error("ssh authentication rejected for user {0:?}")]
    SshAuthRejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// True when the dialer declined the network itself (e.g. `ping4`
    /// over a virtual stack), as opposed to a connection failure.
    pub fn is_unsupported_network(&self) -> bool {
        matches!(self, TunnelError::UnsupportedNetwork { .. })
    }
}

/// Internal probe errors. Expected probe failures are a
/// [`CheckResult`](super::result::CheckResult) with `success == false`,
/// never an `Err`; these variants indicate misconfiguration or bugs and
/// are treated by the monitor as a failed check without retries.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("probe is missing required configuration: {0}")]
    Misconfigured(String),
    #[error("{0}")]
    Internal(String),
}

/// Push notification failures.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("push request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("push endpoint {url} answered {status}")]
    BadStatus { url: String, status: u16 },
    #[error("push cancelled")]
    Cancelled,
}
