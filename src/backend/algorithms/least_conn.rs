//! Least-connections load balancing algorithm.

use super::LoadBalancer;
use crate::backend::RequestContext;
use crate::registry::BackendRef;

/// Least-connections load balancer.
///
/// Sends requests to the backend reporting the fewest active connections.
/// Ties go to the earliest registration.
#[derive(Default)]
pub struct LeastConnections;

impl LeastConnections {
    /// Create a new least-connections load balancer.
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn select(&self, pool: &[BackendRef], _ctx: &RequestContext) -> Option<usize> {
        let mut min_conns = u64::MAX;
        let mut selected = None;

        for (idx, entry) in pool.iter().enumerate() {
            let conns = entry.backend.metrics.active_connections;
            if conns < min_conns {
                min_conns = conns;
                selected = Some(idx);
            }
        }

        selected
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, ServerMetrics};
    use crate::registry::{BackendRegistry, Heartbeat};

    fn pool_with_connections(conns: &[u64]) -> Vec<BackendRef> {
        let registry = BackendRegistry::new();
        for (i, &active) in conns.iter().enumerate() {
            let url = format!("http://127.0.0.1:{}", 8001 + i);
            registry.register(Backend::new(format!("b{i}"), url.clone())).unwrap();
            registry
                .heartbeat(Heartbeat {
                    metrics: Some(ServerMetrics {
                        active_connections: active,
                        ..ServerMetrics::default()
                    }),
                    ..Heartbeat::ping(url)
                })
                .unwrap();
        }
        registry.snapshot().iter().cloned().collect()
    }

    #[test]
    fn test_least_connections_picks_minimum() {
        let lb = LeastConnections::new();
        let servers = pool_with_connections(&[5, 2, 9]);
        assert_eq!(lb.select(&servers, &RequestContext::new()), Some(1));
    }

    #[test]
    fn test_least_connections_tie_goes_to_earliest() {
        let lb = LeastConnections::new();
        let servers = pool_with_connections(&[3, 1, 1]);
        for _ in 0..3 {
            assert_eq!(lb.select(&servers, &RequestContext::new()), Some(1));
        }
    }

    #[test]
    fn test_least_connections_empty() {
        let lb = LeastConnections::new();
        assert!(lb.select(&[], &RequestContext::new()).is_none());
    }
}
