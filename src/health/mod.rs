//! Health checking for registered backends.

mod checker;
mod monitor;
mod state;

pub use checker::{ProbeError, Prober};
pub use monitor::HealthMonitor;
pub use state::{HealthStatus, HealthThresholds, HealthTracker, ProbeOutcome};
