//! Shared application state.
//!
//! Ties the registry, the selector and the background services together
//! and applies configuration reloads.

use crate::backend::{RequestContext, SelectError, SelectorEngine};
use crate::config::Config;
use crate::health::HealthMonitor;
use crate::metrics::MetricsCollector;
use crate::registry::{BackendRef, BackendRegistry, MetricsRoute, RegistryEvent, RegistryServer};
use crate::util::{ServiceHandle, ShutdownSignal};
use arc_swap::ArcSwap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors starting the runtime or applying a reload.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to bind registry server on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Registry server that is currently accepting.
struct ServerSlot {
    address: SocketAddr,
    route: MetricsRoute,
    handle: ServiceHandle,
}

struct Services {
    monitor: ServiceHandle,
    server: ServerSlot,
    /// Outlives reloads; always prunes whichever selector is current.
    pruner: ServiceHandle,
}

/// Shared state accessible from all tasks.
pub struct AppState {
    /// Current configuration (swapped atomically on reload).
    config: ArcSwap<Config>,
    selector: Arc<ArcSwap<SelectorEngine>>,
    registry: Arc<BackendRegistry>,
    metrics: MetricsCollector,
    /// Held for the whole of a reload so reloads never interleave.
    services: Mutex<Option<Services>>,
    shutdown: ShutdownSignal,
}

impl AppState {
    /// Bind the registry server and start health monitoring.
    pub async fn start(config: Config, shutdown: ShutdownSignal) -> Result<Arc<Self>, StateError> {
        let registry = Arc::new(BackendRegistry::new());
        let metrics = MetricsCollector::new();

        let server = bind_server(&config, &registry, &metrics).await?;
        let selector = SelectorEngine::new(&config).with_metrics(metrics.clone());

        let state = Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            selector: Arc::new(ArcSwap::from_pointee(selector)),
            registry,
            metrics,
            services: Mutex::new(None),
            shutdown,
        });

        let monitor = state.start_monitor(&state.config());
        let server = state.start_server(server);
        let pruner = state.start_pruner();
        *state.services.lock().await = Some(Services {
            monitor,
            server,
            pruner,
        });

        Ok(state)
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Address the registry server is accepting on.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.services
            .lock()
            .await
            .as_ref()
            .map(|s| s.server.address)
    }

    /// Pick a healthy backend for one request.
    pub fn select(&self, ctx: &RequestContext) -> Result<BackendRef, SelectError> {
        self.selector.load().select(&self.registry.snapshot(), ctx)
    }

    /// Report how long a backend took to answer.
    pub fn record_response(&self, url: &str, elapsed: Duration) {
        self.selector.load().record_response(url, elapsed);
    }

    /// Apply a new configuration.
    ///
    /// When the listen address changes the new server is bound before
    /// anything else is touched; if that fails the reload is rejected and
    /// the running configuration stays in place.
    pub async fn apply_reload(&self, new: Config) -> Result<(), StateError> {
        let mut services = self.services.lock().await;
        let Some(current) = services.take() else {
            warn!("reload requested after shutdown, ignoring");
            return Ok(());
        };

        let address = new.listen.socket_addr();
        let replacement = if address != current.server.address {
            match bind_server(&new, &self.registry, &self.metrics).await {
                Ok(server) => Some(server),
                Err(e) => {
                    *services = Some(current);
                    return Err(e);
                }
            }
        } else {
            None
        };

        current.monitor.stop().await;
        self.selector
            .store(Arc::new(SelectorEngine::new(&new).with_metrics(self.metrics.clone())));
        let monitor = self.start_monitor(&new);

        let server = match replacement {
            Some(server) => {
                current.server.handle.stop().await;
                self.start_server(server)
            }
            None => {
                current.server.route.store(metrics_path(&new).map(Arc::new));
                current.server
            }
        };

        info!(
            layer = %new.layer(),
            algorithm = %new.algorithm,
            listen = %server.address,
            "configuration reloaded"
        );

        self.config.store(Arc::new(new));
        *services = Some(Services {
            monitor,
            server,
            pruner: current.pruner,
        });
        Ok(())
    }

    /// Stop the monitor, the registry server and selector pruning.
    pub async fn stop(&self) {
        if let Some(services) = self.services.lock().await.take() {
            services.monitor.stop().await;
            services.server.handle.stop().await;
            services.pruner.stop().await;
        }
    }

    fn start_monitor(&self, config: &Config) -> ServiceHandle {
        HealthMonitor::new(Arc::clone(&self.registry), config)
            .with_metrics(self.metrics.clone())
            .start(&self.shutdown.token())
    }

    fn start_pruner(&self) -> ServiceHandle {
        // Subscribed here so no removal after start is missed
        let events = self.registry.subscribe();
        let selector = Arc::clone(&self.selector);
        ServiceHandle::spawn("selector-pruner", &self.shutdown.token(), move |token| {
            prune_departed(selector, events, token)
        })
    }

    fn start_server(&self, server: RegistryServer) -> ServerSlot {
        let address = server.local_addr().unwrap_or_else(|_| self.config().listen.socket_addr());
        let route = server.metrics_route();
        let handle = server.start(&self.shutdown.token());
        ServerSlot {
            address,
            route,
            handle,
        }
    }
}

async fn bind_server(
    config: &Config,
    registry: &Arc<BackendRegistry>,
    metrics: &MetricsCollector,
) -> Result<RegistryServer, StateError> {
    let address = config.listen.socket_addr();
    let server = RegistryServer::bind(address, Arc::clone(registry))
        .await
        .map_err(|source| StateError::Bind { address, source })?;
    Ok(server.with_metrics(metrics.clone(), metrics_path(config)))
}

fn metrics_path(config: &Config) -> Option<String> {
    config.metrics.enabled.then(|| config.metrics.path.clone())
}

/// Drop per-backend selector state as backends leave the registry.
async fn prune_departed(
    selector: Arc<ArcSwap<SelectorEngine>>,
    mut events: broadcast::Receiver<RegistryEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(RegistryEvent::Removed(url)) => {
                    debug!(url = %url, "dropping selector state for removed backend");
                    selector.load().forget(&url);
                }
                Ok(RegistryEvent::Registered(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    // Which backends left is unknown, so start over
                    warn!(skipped, "selector pruning lagged behind registry events, resetting");
                    selector.load().reset();
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::{Algorithm, Layer};

    fn config(algorithm: Algorithm) -> Config {
        let mut config = Config::for_layer(Layer::L4, algorithm);
        config.listen.port = 0;
        config.healthcheck.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_select_uses_registry() {
        let state = AppState::start(config(Algorithm::RoundRobin), ShutdownSignal::new())
            .await
            .unwrap();
        assert!(state.select(&RequestContext::new()).is_err());

        state
            .registry()
            .register(Backend::new("a", "http://127.0.0.1:8001"))
            .unwrap();
        assert_eq!(
            state.select(&RequestContext::new()).unwrap().url(),
            "http://127.0.0.1:8001"
        );

        state.stop().await;
    }

    #[tokio::test]
    async fn test_reload_swaps_algorithm_and_keeps_backends() {
        let state = AppState::start(config(Algorithm::RoundRobin), ShutdownSignal::new())
            .await
            .unwrap();
        state
            .registry()
            .register(Backend::new("a", "http://127.0.0.1:8001"))
            .unwrap();
        let addr = state.local_addr().await.unwrap();

        let mut next = config(Algorithm::LeastTime);
        next.listen.port = addr.port();
        state.apply_reload(next).await.unwrap();

        assert_eq!(state.config().algorithm, Algorithm::LeastTime);
        assert_eq!(state.local_addr().await, Some(addr));
        assert_eq!(state.registry().len(), 1);
        assert!(state.select(&RequestContext::new()).is_ok());

        state.stop().await;
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_removed_backend_state_is_dropped() {
        let state = AppState::start(config(Algorithm::LeastTime), ShutdownSignal::new())
            .await
            .unwrap();
        let registry = state.registry();
        registry.register(Backend::new("a", "http://127.0.0.1:8001")).unwrap();
        registry.register(Backend::new("b", "http://127.0.0.1:8002")).unwrap();
        state.record_response("http://127.0.0.1:8001", Duration::from_millis(10));
        state.record_response("http://127.0.0.1:8002", Duration::from_millis(300));
        assert!(state.metrics().encode().unwrap().contains("127.0.0.1:8002"));

        registry.remove("http://127.0.0.1:8002").unwrap();
        assert!(
            eventually(|| !state.metrics().encode().unwrap().contains("127.0.0.1:8002")).await,
            "response series outlived the backend"
        );

        // Back with no history, so it reads as untried
        registry.register(Backend::new("b", "http://127.0.0.1:8002")).unwrap();
        assert!(
            eventually(|| {
                state
                    .select(&RequestContext::new())
                    .is_ok_and(|e| e.url() == "http://127.0.0.1:8002")
            })
            .await,
            "response average outlived the backend"
        );

        state.stop().await;
    }

    #[tokio::test]
    async fn test_failed_bind_rejects_reload() {
        let state = AppState::start(config(Algorithm::RoundRobin), ShutdownSignal::new())
            .await
            .unwrap();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let mut next = config(Algorithm::LeastTime);
        next.listen.port = occupied.local_addr().unwrap().port();

        assert!(matches!(
            state.apply_reload(next).await,
            Err(StateError::Bind { .. })
        ));
        assert_eq!(state.config().algorithm, Algorithm::RoundRobin);

        state.stop().await;
    }
}
