//! Lifecycle manager: provisions backends, registers them and keeps their
//! heartbeats going until they are removed.

use crate::backend::Backend;
use crate::config::ManagerConfig;
use crate::manager::ManagerError;
use crate::manager::backend_server::BackendServer;
use crate::manager::heartbeat::{HeartbeatSource, heartbeat_loop};
use crate::registry::{Registry, RegistryError, ServerStatus};
use crate::util::ServiceHandle;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time view of a managed backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedServer {
    pub name: String,
    pub port: u16,
    pub url: String,
    pub status: ServerStatus,
    pub started_at: SystemTime,
    pub heartbeating: bool,
}

struct Managed {
    name: String,
    url: String,
    started_at: SystemTime,
    status: Arc<Mutex<ServerStatus>>,
    server: BackendServer,
    heartbeat: ServiceHandle,
}

impl Managed {
    fn view(&self) -> ManagedServer {
        ManagedServer {
            name: self.name.clone(),
            port: self.server.port(),
            url: self.url.clone(),
            status: *self.status.lock(),
            started_at: self.started_at,
            heartbeating: !self.heartbeat.is_finished(),
        }
    }
}

/// Starts and stops in-process backends against any [`Registry`].
pub struct LifecycleManager<R: Registry> {
    registry: Arc<R>,
    config: ManagerConfig,
    servers: Mutex<BTreeMap<u16, Managed>>,
    token: CancellationToken,
}

impl<R: Registry> LifecycleManager<R> {
    pub fn new(registry: Arc<R>, config: ManagerConfig, parent: &CancellationToken) -> Self {
        Self {
            registry,
            config,
            servers: Mutex::new(BTreeMap::new()),
            token: parent.child_token(),
        }
    }

    /// First port in the window that is neither managed nor taken.
    pub async fn find_free_port(&self) -> Result<u16, ManagerError> {
        let (port, _listener) = self.bind_free_port().await?;
        Ok(port)
    }

    /// Probe the window linearly and keep the first listener that binds.
    async fn bind_free_port(&self) -> Result<(u16, TcpListener), ManagerError> {
        let base = self.config.base_port;
        let window = self.config.port_window;

        for offset in 0..window {
            let Some(port) = base.checked_add(offset) else {
                break;
            };
            if self.servers.lock().contains_key(&port) {
                continue;
            }
            match TcpListener::bind(SocketAddr::new(self.config.address, port)).await {
                Ok(listener) => return Ok((port, listener)),
                Err(e) => debug!(port, error = %e, "port unavailable"),
            }
        }

        Err(ManagerError::PortExhausted { base, window })
    }

    /// Start a backend, register it and begin heartbeating.
    pub async fn add_server(&self) -> Result<ManagedServer, ManagerError> {
        let (port, listener) = self.bind_free_port().await?;
        let url = format!("http://{}", SocketAddr::new(self.config.address, port));
        let name = format!("{}-{}", self.config.name_prefix, port);
        let started_at = SystemTime::now();

        let server = BackendServer::start(listener, port, self.config.drain_timeout, &self.token);
        let events = self.registry.watch();

        if let Err(e) = self.registry.register(Backend::new(&name, &url)).await {
            warn!(url = %url, error = %e, "registration failed, stopping backend");
            server.stop().await;
            return Err(e.into());
        }

        let status = Arc::new(Mutex::new(ServerStatus::Running));
        let source = HeartbeatSource {
            port,
            url: url.clone(),
            started_at,
            status: Arc::clone(&status),
            stats: Arc::clone(server.stats()),
        };
        let registry = Arc::clone(&self.registry);
        let every = self.config.heartbeat_interval;
        let heartbeat = ServiceHandle::spawn("heartbeat", &self.token, move |token| {
            heartbeat_loop(registry, source, events, every, token)
        });

        let managed = Managed {
            name,
            url,
            started_at,
            status,
            server,
            heartbeat,
        };
        let view = managed.view();
        self.servers.lock().insert(port, managed);

        info!(name = %view.name, url = %view.url, "backend added");
        Ok(view)
    }

    /// Drain and stop a backend, then unregister it.
    pub async fn remove_server(&self, port: u16) -> Result<(), ManagerError> {
        let managed = self
            .servers
            .lock()
            .remove(&port)
            .ok_or(ManagerError::NotFound(port))?;

        *managed.status.lock() = ServerStatus::ShuttingDown;
        info!(url = %managed.url, "removing backend");

        managed.server.stop().await;

        let removed = match self.registry.remove(&managed.url).await {
            Ok(()) => Ok(()),
            Err(RegistryError::UnknownBackend(_)) => {
                warn!(url = %managed.url, "backend was already unregistered");
                Ok(())
            }
            Err(e) => Err(ManagerError::from(e)),
        };

        managed.heartbeat.stop().await;
        removed
    }

    pub fn list_servers(&self) -> Vec<ManagedServer> {
        self.servers.lock().values().map(Managed::view).collect()
    }

    pub fn get_server(&self, port: u16) -> Option<ManagedServer> {
        self.servers.lock().get(&port).map(Managed::view)
    }

    /// Remove every managed backend.
    pub async fn shutdown(&self) {
        let ports: Vec<u16> = self.servers.lock().keys().copied().collect();
        for port in ports {
            if let Err(e) = self.remove_server(port).await {
                warn!(port, error = %e, "failed to remove backend during shutdown");
            }
        }
        self.token.cancel();
    }
}
