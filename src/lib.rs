//! waypoint - backend registry, health tracking and selection for
//! Layer 4/7 load balancing.
//!
//! - Embedded copy-on-write backend registry with an HTTP protocol
//! - Active probes plus heartbeat liveness with hysteresis
//! - Nine selection algorithms over the healthy pool
//! - Lifecycle manager for in-process backends
//! - Hot configuration reload and Prometheus metrics

pub mod backend;
pub mod config;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod util;

pub use config::Config;
