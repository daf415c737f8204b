//! Least-time load balancing algorithm.

use super::LoadBalancer;
use crate::backend::RequestContext;
use crate::registry::BackendRef;
use dashmap::DashMap;
use std::time::Duration;

/// Least-time load balancer.
///
/// Keeps an exponentially weighted moving average of response time per
/// backend, `ewma' = alpha * sample + (1 - alpha) * ewma`, and picks the
/// lowest. Backends without samples count as zero, so new backends are
/// tried first. Ties go to the earliest registration.
pub struct LeastTime {
    alpha: f64,
    /// Seconds, keyed by backend url.
    ewma: DashMap<String, f64>,
}

impl LeastTime {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            ewma: DashMap::new(),
        }
    }

    /// Current average for a backend.
    pub fn average(&self, url: &str) -> Duration {
        let secs = self.ewma.get(url).map(|v| *v).unwrap_or(0.0);
        Duration::from_secs_f64(secs)
    }
}

impl LoadBalancer for LeastTime {
    fn select(&self, pool: &[BackendRef], _ctx: &RequestContext) -> Option<usize> {
        let mut best = f64::INFINITY;
        let mut selected = None;

        for (idx, entry) in pool.iter().enumerate() {
            let avg = self.ewma.get(entry.url()).map(|v| *v).unwrap_or(0.0);
            if avg < best {
                best = avg;
                selected = Some(idx);
            }
        }

        selected
    }

    fn record_response(&self, url: &str, elapsed: Duration) {
        let sample = elapsed.as_secs_f64();
        let alpha = self.alpha;
        self.ewma
            .entry(url.to_string())
            .and_modify(|avg| *avg = alpha * sample + (1.0 - alpha) * *avg)
            .or_insert(alpha * sample);
    }

    fn forget(&self, url: &str) {
        self.ewma.remove(url);
    }

    fn reset(&self) {
        self.ewma.clear();
    }

    fn name(&self) -> &'static str {
        "least_time"
    }
}
