//! Metrics collection.

mod collector;

pub use collector::{LivenessEvent, MetricsCollector};
