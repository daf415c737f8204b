//! Weighted round-robin load balancing algorithm.

use super::LoadBalancer;
use crate::backend::RequestContext;
use crate::registry::BackendRef;
use std::sync::atomic::{AtomicU64, Ordering};

/// Weighted round-robin load balancer.
///
/// A cursor walks `0..Σweight`; each backend owns a contiguous interval
/// of that range as wide as its weight, in registration order. Weights
/// A=1, B=3 give A, B, B, B. Zero-weight backends own no interval.
pub struct WeightedRoundRobin {
    cursor: AtomicU64,
}

impl WeightedRoundRobin {
    /// Create a new weighted load balancer.
    pub fn new() -> Self {
        Self {
            cursor: AtomicU64::new(0),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn select(&self, pool: &[BackendRef], _ctx: &RequestContext) -> Option<usize> {
        let total: u64 = pool.iter().map(|e| u64::from(e.backend.weight)).sum();
        if total == 0 {
            return None;
        }

        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % total;

        let mut upper = 0u64;
        for (idx, entry) in pool.iter().enumerate() {
            upper += u64::from(entry.backend.weight);
            if position < upper {
                return Some(idx);
            }
        }
        None
    }

    fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::test_support::pool;

    #[test]
    fn test_weighted_sequence() {
        let lb = WeightedRoundRobin::new();
        let servers = pool(&[(8001, 1), (8002, 3)]);
        let ctx = RequestContext::new();

        let picks: Vec<usize> = (0..8).map(|_| lb.select(&servers, &ctx).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 1, 1, 0, 1, 1, 1]);
    }

    #[test]
    fn test_weighted_proportions() {
        let lb = WeightedRoundRobin::new();
        let servers = pool(&[(8001, 3), (8002, 1)]);
        let ctx = RequestContext::new();

        let mut counts = [0; 2];
        for _ in 0..40 {
            counts[lb.select(&servers, &ctx).unwrap()] += 1;
        }
        assert_eq!(counts, [30, 10]);
    }

    #[test]
    fn test_zero_weight_never_chosen() {
        let lb = WeightedRoundRobin::new();
        let servers = pool(&[(8001, 0), (8002, 2)]);
        let ctx = RequestContext::new();

        for _ in 0..10 {
            assert_eq!(lb.select(&servers, &ctx), Some(1));
        }
    }

    #[test]
    fn test_all_zero_weights() {
        let lb = WeightedRoundRobin::new();
        let servers = pool(&[(8001, 0), (8002, 0)]);
        assert!(lb.select(&servers, &RequestContext::new()).is_none());
    }
}
