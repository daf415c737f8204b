//! Backend registry.
//!
//! The [`Registry`] trait is the contract backends (or whatever manages
//! them) use to announce themselves. [`BackendRegistry`] is the embedded,
//! authoritative store; [`RemoteRegistry`] speaks the same contract over
//! the HTTP protocol served by [`RegistryServer`].

mod client;
mod server;
mod store;

pub use client::RemoteRegistry;
pub use server::{MetricsRoute, RegistryServer};
pub use store::{BackendEntry, BackendRef, BackendRegistry, ProbeRecorded, Snapshot};

use crate::backend::{Backend, ServerMetrics};
use crate::config::serde_time;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("backend already registered: {0}")]
    DuplicateBackend(String),

    #[error("invalid backend: {0}")]
    InvalidBackend(String),

    #[error("registry unreachable: {0}")]
    Transport(String),

    #[error("registry rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Lifecycle state a backend reports about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Starting,
    #[default]
    Running,
    ShuttingDown,
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::ShuttingDown => "shutting_down",
            ServerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Body of `POST /heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub port: u16,

    pub url: String,

    #[serde(default)]
    pub status: ServerStatus,

    #[serde(default, with = "serde_time::option_rfc3339")]
    pub started_at: Option<SystemTime>,

    /// Absent metrics refresh liveness only
    #[serde(default)]
    pub metrics: Option<ServerMetrics>,
}

impl Heartbeat {
    /// A liveness-only heartbeat.
    pub fn ping(url: impl Into<String>) -> Self {
        Self {
            port: 0,
            url: url.into(),
            status: ServerStatus::Running,
            started_at: None,
            metrics: None,
        }
    }
}

/// Membership change published by the embedded registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(String),
    Removed(String),
}

/// Register / heartbeat / remove contract.
pub trait Registry: Send + Sync + 'static {
    fn register(&self, backend: Backend) -> impl Future<Output = Result<(), RegistryError>> + Send;

    fn heartbeat(
        &self,
        heartbeat: Heartbeat,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;

    fn remove(&self, url: &str) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Membership events, when the registry can push them.
    fn watch(&self) -> Option<broadcast::Receiver<RegistryEvent>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_wire_format() {
        let json = r#"{
            "port": 8001,
            "url": "http://127.0.0.1:8001",
            "status": "shutting_down",
            "started_at": "2024-05-01T10:00:00Z",
            "metrics": { "active_connections": 4 }
        }"#;
        let hb: Heartbeat = serde_json::from_str(json).unwrap();
        assert_eq!(hb.port, 8001);
        assert_eq!(hb.status, ServerStatus::ShuttingDown);
        assert!(hb.started_at.is_some());
        assert_eq!(hb.metrics.map(|m| m.active_connections), Some(4));
    }

    #[test]
    fn test_ping_has_no_metrics() {
        let hb: Heartbeat = serde_json::from_str(r#"{"url":"http://a"}"#).unwrap();
        assert_eq!(hb, Heartbeat::ping("http://a"));
    }
}
