//! Heartbeat task for a managed backend.

use crate::manager::backend_server::ServerStats;
use crate::registry::{Heartbeat, Registry, RegistryError, RegistryEvent, ServerStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything one heartbeat loop reports about its backend.
pub(crate) struct HeartbeatSource {
    pub port: u16,
    pub url: String,
    pub started_at: SystemTime,
    pub status: Arc<Mutex<ServerStatus>>,
    pub stats: Arc<ServerStats>,
}

impl HeartbeatSource {
    pub(crate) fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            port: self.port,
            url: self.url.clone(),
            status: *self.status.lock(),
            started_at: Some(self.started_at),
            metrics: Some(self.stats.sample()),
        }
    }
}

/// Send a heartbeat every `every` until cancelled or the backend is
/// removed from the registry by someone else.
///
/// `events` should be subscribed before the backend registers so no
/// removal can slip past.
pub(crate) async fn heartbeat_loop<R: Registry>(
    registry: Arc<R>,
    source: HeartbeatSource,
    mut events: Option<broadcast::Receiver<RegistryEvent>>,
    every: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Registration counted as the first one.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            _ = removed(&mut events, &source.url) => {
                info!(url = %source.url, "backend removed externally, stopping heartbeat");
                break;
            }

            _ = ticker.tick() => {
                match registry.heartbeat(source.heartbeat()).await {
                    Ok(()) => debug!(url = %source.url, "heartbeat delivered"),
                    Err(RegistryError::UnknownBackend(_)) => {
                        info!(url = %source.url, "registry no longer knows backend, stopping heartbeat");
                        break;
                    }
                    Err(e) => {
                        warn!(url = %source.url, error = %e, "heartbeat failed, retrying next tick");
                    }
                }
            }
        }
    }
}

/// Resolve once a `Removed` event for `url` arrives. Pends forever when
/// the registry has no event stream.
async fn removed(events: &mut Option<broadcast::Receiver<RegistryEvent>>, url: &str) {
    let Some(rx) = events else {
        return std::future::pending().await;
    };

    loop {
        match rx.recv().await {
            Ok(RegistryEvent::Removed(removed)) if removed == url => return,
            Ok(_) => {}
            // A missed removal still surfaces as UnknownBackend on the next tick.
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => {
                *events = None;
                return std::future::pending().await;
            }
        }
    }
}
