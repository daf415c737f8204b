//! Metrics collector using prometheus-client.
//!
//! Provides metrics for backend health, probes, registry traffic and
//! selections.

use crate::health::HealthStatus;
use crate::registry::BackendRef;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for per-backend metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Labels for backend counts by health status.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status: StatusLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum StatusLabel {
    Healthy,
    Suspect,
    Unhealthy,
}

impl From<HealthStatus> for StatusLabel {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => StatusLabel::Healthy,
            HealthStatus::Suspect => StatusLabel::Suspect,
            HealthStatus::Unhealthy => StatusLabel::Unhealthy,
        }
    }
}

/// Labels for probe metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub backend: String,
    pub result: ProbeResult,
}

/// Result of a health probe.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ProbeResult {
    Success,
    Failure,
}

/// Labels for heartbeat-liveness events.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LivenessLabels {
    pub event: LivenessEvent,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LivenessEvent {
    Stale,
    Evicted,
}

/// Labels for registry protocol requests.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RegistryLabels {
    pub operation: String,
    pub status: String,
}

/// Labels for selection outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SelectionLabels {
    pub algorithm: String,
    pub result: SelectionResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SelectionResult {
    Selected,
    NoBackend,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Registered backends by health status.
    backends: Family<StatusLabels, Gauge>,
    /// Backend eligibility (1 = selectable, 0 = not).
    backend_healthy: Family<BackendLabels, Gauge>,
    /// Active connections reported by each backend.
    backend_active_connections: Family<BackendLabels, Gauge>,
    /// Response times fed to least_time, in seconds.
    backend_response_seconds: Family<BackendLabels, Histogram>,
    /// Probe results.
    health_probes_total: Family<ProbeLabels, Counter>,
    /// Passing-bit flips by resulting status.
    health_transitions_total: Family<StatusLabels, Counter>,
    /// Backends marked stale or evicted for missing heartbeats.
    liveness_total: Family<LivenessLabels, Counter>,
    /// Registry protocol requests.
    registry_requests_total: Family<RegistryLabels, Counter>,
    /// Selection outcomes.
    selections_total: Family<SelectionLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let backends = Family::<StatusLabels, Gauge>::default();
        let backend_healthy = Family::<BackendLabels, Gauge>::default();
        let backend_active_connections = Family::<BackendLabels, Gauge>::default();
        let backend_response_seconds =
            Family::<BackendLabels, Histogram>::new_with_constructor(|| {
                // 1ms .. ~15s
                Histogram::new(exponential_buckets(0.001, 2.5, 12))
            });
        let health_probes_total = Family::<ProbeLabels, Counter>::default();
        let health_transitions_total = Family::<StatusLabels, Counter>::default();
        let liveness_total = Family::<LivenessLabels, Counter>::default();
        let registry_requests_total = Family::<RegistryLabels, Counter>::default();
        let selections_total = Family::<SelectionLabels, Counter>::default();

        registry.register(
            "waypoint_backends",
            "Registered backends by health status",
            backends.clone(),
        );
        registry.register(
            "waypoint_backend_healthy",
            "Backend eligibility for selection (1=eligible, 0=excluded)",
            backend_healthy.clone(),
        );
        registry.register(
            "waypoint_backend_active_connections",
            "Active connections reported by the backend",
            backend_active_connections.clone(),
        );
        registry.register(
            "waypoint_backend_response_seconds",
            "Observed backend response time in seconds",
            backend_response_seconds.clone(),
        );
        registry.register(
            "waypoint_health_probes",
            "Total number of health probes performed",
            health_probes_total.clone(),
        );
        registry.register(
            "waypoint_health_transitions",
            "Total number of health state transitions",
            health_transitions_total.clone(),
        );
        registry.register(
            "waypoint_liveness_events",
            "Backends marked stale or evicted for missing heartbeats",
            liveness_total.clone(),
        );
        registry.register(
            "waypoint_registry_requests",
            "Total number of registry protocol requests",
            registry_requests_total.clone(),
        );
        registry.register(
            "waypoint_selections",
            "Total number of backend selections",
            selections_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                backends,
                backend_healthy,
                backend_active_connections,
                backend_response_seconds,
                health_probes_total,
                health_transitions_total,
                liveness_total,
                registry_requests_total,
                selections_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Encode every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.inner.registry)?;
        Ok(buffer)
    }

    /// Refresh the per-backend gauges from a registry snapshot.
    pub fn observe_snapshot(&self, snapshot: &[BackendRef]) {
        self.inner.backend_healthy.clear();
        self.inner.backend_active_connections.clear();

        let (mut healthy, mut suspect, mut unhealthy) = (0, 0, 0);
        for entry in snapshot {
            let labels = BackendLabels {
                backend: entry.backend.url.clone(),
            };
            self.inner
                .backend_healthy
                .get_or_create(&labels)
                .set(i64::from(entry.is_healthy()));
            self.inner
                .backend_active_connections
                .get_or_create(&labels)
                .set(entry.backend.metrics.active_connections as i64);

            match entry.status() {
                HealthStatus::Healthy => healthy += 1,
                HealthStatus::Suspect => suspect += 1,
                HealthStatus::Unhealthy => unhealthy += 1,
            }
        }

        for (status, count) in [
            (StatusLabel::Healthy, healthy),
            (StatusLabel::Suspect, suspect),
            (StatusLabel::Unhealthy, unhealthy),
        ] {
            self.inner
                .backends
                .get_or_create(&StatusLabels { status })
                .set(count);
        }
    }

    /// Record a probe result.
    pub fn record_probe(&self, backend: &str, success: bool) {
        let labels = ProbeLabels {
            backend: backend.to_string(),
            result: if success {
                ProbeResult::Success
            } else {
                ProbeResult::Failure
            },
        };
        self.inner.health_probes_total.get_or_create(&labels).inc();
    }

    /// Record a passing-bit flip.
    pub fn record_transition(&self, status: HealthStatus) {
        let labels = StatusLabels {
            status: status.into(),
        };
        self.inner.health_transitions_total.get_or_create(&labels).inc();
    }

    /// Record backends marked stale or evicted in one sweep.
    pub fn record_liveness(&self, event: LivenessEvent, count: usize) {
        if count == 0 {
            return;
        }
        self.inner
            .liveness_total
            .get_or_create(&LivenessLabels { event })
            .inc_by(count as u64);
    }

    /// Record a registry protocol request.
    pub fn record_registry_request(&self, operation: &str, status: u16) {
        let labels = RegistryLabels {
            operation: operation.to_string(),
            status: status.to_string(),
        };
        self.inner.registry_requests_total.get_or_create(&labels).inc();
    }

    /// Record a selection outcome.
    pub fn record_selection(&self, algorithm: &str, selected: bool) {
        let labels = SelectionLabels {
            algorithm: algorithm.to_string(),
            result: if selected {
                SelectionResult::Selected
            } else {
                SelectionResult::NoBackend
            },
        };
        self.inner.selections_total.get_or_create(&labels).inc();
    }

    /// Drop every per-backend series for a backend that left the registry.
    pub fn forget_backend(&self, backend: &str) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner.backend_healthy.remove(&labels);
        self.inner.backend_active_connections.remove(&labels);
        self.inner.backend_response_seconds.remove(&labels);
        for result in [ProbeResult::Success, ProbeResult::Failure] {
            self.inner.health_probes_total.remove(&ProbeLabels {
                backend: backend.to_string(),
                result,
            });
        }
    }

    /// Record an observed backend response time.
    pub fn record_response(&self, backend: &str, elapsed: Duration) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner
            .backend_response_seconds
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }
}
