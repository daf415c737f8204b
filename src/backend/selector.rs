//! Selector engine.
//!
//! Filters a registry snapshot down to the healthy pool and hands it to
//! the configured algorithm. The engine owns all algorithm state; a hot
//! reload replaces the whole engine.

use crate::backend::RequestContext;
use crate::backend::algorithms::{
    HashRing, LeastConnections, LeastTime, LoadBalancer, RoundRobin, Sticky, WeightedRoundRobin,
};
use crate::config::{Algorithm, Config, L7Settings, LayerSettings, SelectorConfig};
use crate::metrics::MetricsCollector;
use crate::registry::BackendRef;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Selection failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no available backend")]
    NoAvailableBackend,
}

/// Chooses one backend per request.
pub struct SelectorEngine {
    algorithm: Algorithm,
    strategy: Box<dyn LoadBalancer>,
    metrics: Option<MetricsCollector>,
}

impl SelectorEngine {
    /// Build the engine for a configuration.
    pub fn new(config: &Config) -> Self {
        let l7 = match &config.settings {
            LayerSettings::L7(l7) => Some(l7),
            LayerSettings::L4(_) => None,
        };
        Self::build(config.algorithm, &config.selector, l7)
    }

    /// Build an engine with default tuning.
    pub fn for_algorithm(algorithm: Algorithm) -> Self {
        Self::build(algorithm, &SelectorConfig::default(), None)
    }

    fn build(algorithm: Algorithm, tuning: &SelectorConfig, l7: Option<&L7Settings>) -> Self {
        let defaults = L7Settings::default();
        let l7 = l7.unwrap_or(&defaults);

        let strategy: Box<dyn LoadBalancer> = match algorithm {
            Algorithm::RoundRobin => Box::new(RoundRobin::new()),
            Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
            Algorithm::LeastConnections => Box::new(LeastConnections::new()),
            Algorithm::StickyRoundRobin => Box::new(Sticky::by_session(tuning.session_ttl)),
            Algorithm::CookieBased => Box::new(Sticky::by_cookie(
                l7.sticky.cookie_name.clone(),
                tuning.session_ttl,
            )),
            Algorithm::IpHash => Box::new(HashRing::by_client_ip(tuning.virtual_nodes)),
            Algorithm::UrlHash => Box::new(HashRing::by_path(tuning.virtual_nodes)),
            Algorithm::ContentBased => {
                let header = l7.content.header.as_deref().unwrap_or_default();
                Box::new(HashRing::by_header(header, tuning.virtual_nodes))
            }
            Algorithm::LeastTime => Box::new(LeastTime::new(tuning.ewma_alpha)),
        };

        Self {
            algorithm,
            strategy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Select exactly one healthy backend from `snapshot`.
    ///
    /// Never falls back to an unhealthy backend.
    pub fn select(
        &self,
        snapshot: &[BackendRef],
        ctx: &RequestContext,
    ) -> Result<BackendRef, SelectError> {
        let pool: Vec<BackendRef> = snapshot.iter().filter(|e| e.is_healthy()).cloned().collect();

        let selected = if pool.is_empty() {
            None
        } else {
            self.strategy
                .select(&pool, ctx)
                .and_then(|idx| pool.get(idx).cloned())
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_selection(self.strategy.name(), selected.is_some());
        }

        match selected {
            Some(entry) => {
                debug!(
                    algorithm = self.strategy.name(),
                    backend = %entry.url(),
                    pool = pool.len(),
                    "selected backend"
                );
                Ok(entry)
            }
            None => {
                warn!(
                    algorithm = self.strategy.name(),
                    registered = snapshot.len(),
                    healthy = pool.len(),
                    "no available backend"
                );
                Err(SelectError::NoAvailableBackend)
            }
        }
    }

    /// Feed an observed response time; only least_time uses it.
    pub fn record_response(&self, url: &str, elapsed: Duration) {
        self.strategy.record_response(url, elapsed);
        if let Some(metrics) = &self.metrics {
            metrics.record_response(url, elapsed);
        }
    }

    /// Drop state and response series kept for a departed backend.
    pub fn forget(&self, url: &str) {
        self.strategy.forget(url);
        if let Some(metrics) = &self.metrics {
            metrics.forget_backend(url);
        }
    }

    /// Clear all algorithm-local state.
    pub fn reset(&self) {
        self.strategy.reset();
    }
}
