//! Backend lifecycle management.

mod backend_server;
mod heartbeat;
mod lifecycle;

pub use backend_server::{BackendServer, ServerStats};
pub use lifecycle::{LifecycleManager, ManagedServer};

use crate::registry::RegistryError;
use thiserror::Error;

/// Errors from provisioning or removing backends.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no free port in {base}..{base}+{window}")]
    PortExhausted { base: u16, window: u16 },

    #[error("no managed backend on port {0}")]
    NotFound(u16),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
