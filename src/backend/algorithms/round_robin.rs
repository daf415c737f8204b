//! Round-robin load balancing algorithm.

use super::LoadBalancer;
use crate::backend::RequestContext;
use crate::registry::BackendRef;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin load balancer.
///
/// Distributes requests evenly across the healthy pool in registration order.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Create a new round-robin load balancer.
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Next index for a pool of `len` backends.
    pub(crate) fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % len)
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, pool: &[BackendRef], _ctx: &RequestContext) -> Option<usize> {
        self.next_index(pool.len())
    }

    fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::test_support::pool;

    #[test]
    fn test_round_robin_distribution() {
        let lb = RoundRobin::new();
        let servers = pool(&[(8001, 1), (8002, 1), (8003, 1)]);
        let ctx = RequestContext::new();

        let picks: Vec<usize> = (0..6).map(|_| lb.select(&servers, &ctx).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_empty() {
        let lb = RoundRobin::new();
        assert!(lb.select(&[], &RequestContext::new()).is_none());
    }

    #[test]
    fn test_round_robin_single_server() {
        let lb = RoundRobin::new();
        let servers = pool(&[(8001, 1)]);
        for _ in 0..5 {
            assert_eq!(lb.select(&servers, &RequestContext::new()), Some(0));
        }
    }

    #[test]
    fn test_reset_restarts_rotation() {
        let lb = RoundRobin::new();
        let servers = pool(&[(8001, 1), (8002, 1)]);
        lb.select(&servers, &RequestContext::new());
        lb.reset();
        assert_eq!(lb.select(&servers, &RequestContext::new()), Some(0));
    }
}
