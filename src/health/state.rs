//! Health state machine.
//!
//! Eligibility is a hysteresis bit: a backend stops passing after
//! `failure_threshold` consecutive probe failures and passes again after
//! `success_threshold` consecutive successes. The reported status adds a
//! `Suspect` state for backends that are partway to a transition.

use crate::config::HealthCheckConfig;
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;

/// Reported health of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Suspect,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Suspect => f.write_str("suspect"),
            HealthStatus::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Consecutive-result thresholds for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Consecutive failures before marking unhealthy.
    pub failure: u32,
    /// Consecutive successes before marking healthy.
    pub success: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failure: 3,
            success: 2,
        }
    }
}

impl From<&HealthCheckConfig> for HealthThresholds {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            failure: config.failure_threshold,
            success: config.success_threshold,
        }
    }
}

/// Result of one active probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
}

/// Per-backend health tracker.
///
/// Not synchronized; the registry serializes every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTracker {
    passing: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Set when heartbeats stop; blocks promotion until the next heartbeat.
    stale: bool,
    last_check: Option<SystemTime>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    /// A fresh tracker starts passing.
    pub fn new() -> Self {
        Self {
            passing: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            stale: false,
            last_check: None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        match (self.passing, self.consecutive_failures, self.consecutive_successes) {
            (true, 0, _) => HealthStatus::Healthy,
            (false, _, 0) => HealthStatus::Unhealthy,
            _ => HealthStatus::Suspect,
        }
    }

    pub fn is_passing(&self) -> bool {
        self.passing
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn last_check(&self) -> Option<SystemTime> {
        self.last_check
    }

    /// Apply a probe outcome. Returns true when the passing bit flipped.
    pub fn record(&mut self, outcome: ProbeOutcome, thresholds: HealthThresholds) -> bool {
        match outcome {
            ProbeOutcome::Success => self.record_success(thresholds),
            ProbeOutcome::Failure => self.record_failure(thresholds),
        }
    }

    /// Record a successful probe.
    pub fn record_success(&mut self, thresholds: HealthThresholds) -> bool {
        self.last_check = Some(SystemTime::now());
        self.consecutive_failures = 0;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);

        if !self.passing && !self.stale && self.consecutive_successes >= thresholds.success {
            self.passing = true;
            return true;
        }
        false
    }

    /// Record a failed probe.
    pub fn record_failure(&mut self, thresholds: HealthThresholds) -> bool {
        self.last_check = Some(SystemTime::now());
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.passing && self.consecutive_failures >= thresholds.failure {
            self.passing = false;
            return true;
        }
        false
    }

    /// Force unhealthy because heartbeats stopped. Returns true when the
    /// passing bit flipped.
    pub fn mark_stale(&mut self) -> bool {
        let was_passing = self.passing;
        self.stale = true;
        self.passing = false;
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
        was_passing
    }

    /// A heartbeat arrived; probes may promote again.
    ///
    /// With `promote` set the tracker passes immediately instead, for
    /// registries that run no active probes. Returns true when the passing
    /// bit flipped.
    pub fn clear_stale(&mut self, promote: bool) -> bool {
        if !self.stale {
            return false;
        }
        self.stale = false;
        self.consecutive_successes = 0;
        if promote { self.restore() } else { false }
    }

    /// Pass again with clean counters. Returns true when the passing bit
    /// flipped.
    pub fn restore(&mut self) -> bool {
        let was_passing = self.passing;
        self.passing = true;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        !was_passing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds::default()
    }

    #[test]
    fn test_new_tracker_is_healthy() {
        let tracker = HealthTracker::new();
        assert!(tracker.is_passing());
        assert_eq!(tracker.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_failures_demote_at_threshold() {
        let mut tracker = HealthTracker::new();

        assert!(!tracker.record_failure(thresholds()));
        assert_eq!(tracker.status(), HealthStatus::Suspect);
        assert!(tracker.is_passing());

        assert!(!tracker.record_failure(thresholds()));
        assert!(tracker.is_passing());

        assert!(tracker.record_failure(thresholds()));
        assert!(!tracker.is_passing());
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_successes_promote_at_threshold() {
        let mut tracker = HealthTracker::new();
        for _ in 0..3 {
            tracker.record_failure(thresholds());
        }

        assert!(!tracker.record_success(thresholds()));
        assert_eq!(tracker.status(), HealthStatus::Suspect);
        assert!(!tracker.is_passing());

        assert!(tracker.record_success(thresholds()));
        assert_eq!(tracker.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_interleaved_results_reset_counters() {
        let mut tracker = HealthTracker::new();
        tracker.record_failure(thresholds());
        tracker.record_failure(thresholds());
        tracker.record_success(thresholds());
        assert_eq!(tracker.failures(), 0);
        assert_eq!(tracker.status(), HealthStatus::Healthy);

        tracker.record_failure(thresholds());
        tracker.record_failure(thresholds());
        assert!(tracker.is_passing());
    }

    #[test]
    fn test_stale_blocks_promotion_until_cleared() {
        let mut tracker = HealthTracker::new();
        assert!(tracker.mark_stale());
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);

        for _ in 0..5 {
            assert!(!tracker.record_success(thresholds()));
        }
        assert!(!tracker.is_passing());

        assert!(!tracker.clear_stale(false));
        assert!(!tracker.record_success(thresholds()));
        assert!(tracker.record_success(thresholds()));
        assert!(tracker.is_passing());
    }

    #[test]
    fn test_clear_stale_with_promotion_passes_at_once() {
        let mut tracker = HealthTracker::new();
        tracker.mark_stale();

        assert!(tracker.clear_stale(true));
        assert!(tracker.is_passing());
        assert!(!tracker.is_stale());
        assert_eq!(tracker.status(), HealthStatus::Healthy);

        // Nothing to clear the second time.
        assert!(!tracker.clear_stale(true));
    }

    #[test]
    fn test_mark_stale_twice_reports_no_flip() {
        let mut tracker = HealthTracker::new();
        assert!(tracker.mark_stale());
        assert!(!tracker.mark_stale());
    }

    #[test]
    fn test_threshold_of_one() {
        let t = HealthThresholds {
            failure: 1,
            success: 1,
        };
        let mut tracker = HealthTracker::new();
        assert!(tracker.record(ProbeOutcome::Failure, t));
        assert!(tracker.record(ProbeOutcome::Success, t));
    }
}
