//! Load balancing algorithms.

mod hash_ring;
mod least_conn;
mod least_time;
mod round_robin;
mod sticky;
mod weighted;

pub use hash_ring::{HashKey, HashRing};
pub use least_conn::LeastConnections;
pub use least_time::LeastTime;
pub use round_robin::RoundRobin;
pub use sticky::{SessionKey, Sticky};
pub use weighted::WeightedRoundRobin;

use crate::backend::RequestContext;
use crate::registry::BackendRef;
use std::time::Duration;

/// Trait for load balancing algorithms.
pub trait LoadBalancer: Send + Sync {
    /// Select a backend from the healthy pool.
    ///
    /// # Arguments
    ///
    /// * `pool` - Healthy backends in registration order, never empty
    /// * `ctx` - Attributes of the request being routed
    ///
    /// # Returns
    ///
    /// The index of the chosen backend in `pool`, or None if none qualifies.
    fn select(&self, pool: &[BackendRef], ctx: &RequestContext) -> Option<usize>;

    /// Feed an observed response time for a backend.
    fn record_response(&self, _url: &str, _elapsed: Duration) {}

    /// Drop state kept for a backend that left the registry.
    fn forget(&self, _url: &str) {}

    /// Drop all algorithm-local state.
    fn reset(&self) {}

    /// Name as written in configuration files.
    fn name(&self) -> &'static str;
}
