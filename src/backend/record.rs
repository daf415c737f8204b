//! Backend descriptor and its metrics snapshot.
//!
//! This is also the JSON body of `POST /register` and `POST /remove`, so
//! every field has a default and sparse descriptors decode.

use crate::config::serde_time;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// An upstream server instance eligible to receive traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    #[serde(default)]
    pub name: String,

    /// Unique key in the registry
    pub url: String,

    /// Relative weight, 0 is never chosen by weighted selection
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_max_connections")]
    pub max_connections: u64,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,

    #[serde(default = "default_queue_timeout", with = "serde_time::duration")]
    pub queue_timeout: Duration,

    #[serde(default = "default_connection_timeout", with = "serde_time::duration")]
    pub connection_timeout: Duration,

    #[serde(default = "default_max_response_time", with = "serde_time::duration")]
    pub max_response_time: Duration,

    /// CPU percentage threshold
    #[serde(default = "default_percent_limit")]
    pub max_cpu_usage: f64,

    /// Memory percentage threshold
    #[serde(default = "default_percent_limit")]
    pub max_memory_usage: f64,

    /// Derived from the metrics on every update
    #[serde(default)]
    pub queue_full: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub maintenance_mode: bool,

    #[serde(default, alias = "ssl", skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,

    #[serde(default)]
    pub metrics: ServerMetrics,
}

/// TLS settings advertised by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub verify: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

/// Point-in-time metrics reported by a backend.
///
/// The four health fields belong to the health state machine; see
/// [`Backend::update_metrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerMetrics {
    // Connections
    pub active_connections: u64,
    pub total_connections: u64,
    /// Connections per second
    pub connection_rate: f64,
    pub queued_connections: u64,
    pub dropped_connections: u64,

    // Timing
    /// Average response time
    #[serde(with = "serde_time::duration")]
    pub response_time: Duration,
    #[serde(with = "serde_time::duration")]
    pub last_response_time: Duration,
    #[serde(with = "serde_time::duration")]
    pub processing_time: Duration,
    #[serde(with = "serde_time::duration")]
    pub queue_time: Duration,

    // Resources
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_io_usage: f64,
    pub network_bandwidth: f64,

    // Health
    #[serde(with = "serde_time::option_rfc3339")]
    pub last_health_check: Option<SystemTime>,
    pub health_check_status: bool,
    pub failure_count: u32,
    pub success_count: u32,

    // Layer 7
    pub request_count: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            active_connections: 0,
            total_connections: 0,
            connection_rate: 0.0,
            queued_connections: 0,
            dropped_connections: 0,
            response_time: Duration::ZERO,
            last_response_time: Duration::ZERO,
            processing_time: Duration::ZERO,
            queue_time: Duration::ZERO,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_io_usage: 0.0,
            network_bandwidth: 0.0,
            last_health_check: None,
            health_check_status: true,
            failure_count: 0,
            success_count: 0,
            request_count: 0,
            successful_requests: 0,
            failed_requests: 0,
            status_4xx: 0,
            status_5xx: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

impl Backend {
    /// Create a backend with default limits.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            weight: default_weight(),
            max_connections: default_max_connections(),
            max_queue_size: default_max_queue_size(),
            queue_timeout: default_queue_timeout(),
            connection_timeout: default_connection_timeout(),
            max_response_time: default_max_response_time(),
            max_cpu_usage: default_percent_limit(),
            max_memory_usage: default_percent_limit(),
            queue_full: false,
            enabled: true,
            maintenance_mode: false,
            tls: None,
            metrics: ServerMetrics::default(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Whether this backend may receive traffic right now.
    ///
    /// The sole eligibility predicate used by selection.
    pub fn is_healthy(&self) -> bool {
        let m = &self.metrics;
        self.enabled
            && !self.maintenance_mode
            && m.health_check_status
            && m.active_connections < self.max_connections
            && m.cpu_usage < self.max_cpu_usage
            && m.memory_usage < self.max_memory_usage
            && m.response_time < self.max_response_time
    }

    /// Replace metrics with a reported snapshot.
    ///
    /// Health fields are kept from the current state and `queue_full`
    /// is recomputed.
    pub fn update_metrics(&mut self, reported: ServerMetrics) {
        let previous = std::mem::replace(&mut self.metrics, reported);
        self.metrics.health_check_status = previous.health_check_status;
        self.metrics.failure_count = previous.failure_count;
        self.metrics.success_count = previous.success_count;
        self.metrics.last_health_check = previous.last_health_check;
        self.refresh_queue_full();
    }

    /// Write the health state machine's view into the metrics.
    pub(crate) fn set_health(
        &mut self,
        passing: bool,
        failures: u32,
        successes: u32,
        checked_at: Option<SystemTime>,
    ) {
        self.metrics.health_check_status = passing;
        self.metrics.failure_count = failures;
        self.metrics.success_count = successes;
        if checked_at.is_some() {
            self.metrics.last_health_check = checked_at;
        }
    }

    pub(crate) fn refresh_queue_full(&mut self) {
        self.queue_full = self.metrics.queued_connections >= self.max_queue_size;
    }
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u64 {
    10_000
}

fn default_max_queue_size() -> u64 {
    1000
}

fn default_queue_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_response_time() -> Duration {
    Duration::from_secs(30)
}

fn default_percent_limit() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}
