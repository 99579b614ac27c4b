//! Monitor plane: probes, tunnels, scheduling, and notification.

pub mod dial;
pub mod error;
pub mod factory;
pub mod monitor;
pub mod notifier;
pub mod probe;
pub mod result;
pub mod tunnel;
pub mod watchdog;

pub use error::{ProbeError, PushError, TunnelError};
pub use factory::setup_probe;
pub use monitor::ServiceMonitor;
pub use notifier::Notifier;
pub use probe::Probe;
pub use result::CheckResult;
pub use tunnel::{Tunnel, TunnelRegistry};
pub use watchdog::Watchdog;
